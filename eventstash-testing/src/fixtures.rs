//! A small ledger domain and record builders shared by engine tests.

use eventstash::{
    DomainEvent, Event, EventId, EventType, Mapper, Record, Stream, Timestamp, TypeRegistry,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An account was opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountOpened {
    /// Account name
    pub account: String,
    /// Who owns it
    pub owner: String,
}

/// Money was paid into an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyDeposited {
    /// Account name
    pub account: String,
    /// Amount
    pub amount: u64,
}

/// Money was taken out of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyWithdrawn {
    /// Account name
    pub account: String,
    /// Amount
    pub amount: u64,
}

/// Every event of the ledger domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum LedgerEvent {
    /// `AccountOpened`
    Opened(AccountOpened),
    /// `MoneyDeposited`
    Deposited(MoneyDeposited),
    /// `MoneyWithdrawn`
    Withdrawn(MoneyWithdrawn),
}

impl DomainEvent for LedgerEvent {
    fn event_type(&self) -> &str {
        match self {
            Self::Opened(_) => "AccountOpened",
            Self::Deposited(_) => "MoneyDeposited",
            Self::Withdrawn(_) => "MoneyWithdrawn",
        }
    }
}

impl From<AccountOpened> for LedgerEvent {
    fn from(event: AccountOpened) -> Self {
        Self::Opened(event)
    }
}

impl From<MoneyDeposited> for LedgerEvent {
    fn from(event: MoneyDeposited) -> Self {
        Self::Deposited(event)
    }
}

impl From<MoneyWithdrawn> for LedgerEvent {
    fn from(event: MoneyWithdrawn) -> Self {
        Self::Withdrawn(event)
    }
}

/// Registry resolving the three ledger event types.
pub fn ledger_registry() -> TypeRegistry<LedgerEvent> {
    TypeRegistry::new()
        .register::<AccountOpened>("AccountOpened")
        .register::<MoneyDeposited>("MoneyDeposited")
        .register::<MoneyWithdrawn>("MoneyWithdrawn")
}

/// JSON mapper over [`ledger_registry`].
pub fn ledger_mapper() -> Mapper<LedgerEvent> {
    Mapper::new(ledger_registry())
}

/// `AccountOpened` for `account`.
pub fn opened(account: &str) -> Event<LedgerEvent> {
    Event::new(LedgerEvent::Opened(AccountOpened {
        account: account.to_string(),
        owner: format!("owner of {account}"),
    }))
}

/// `MoneyDeposited` of `amount` into `account`.
pub fn deposited(account: &str, amount: u64) -> Event<LedgerEvent> {
    Event::new(LedgerEvent::Deposited(MoneyDeposited {
        account: account.to_string(),
        amount,
    }))
}

/// `MoneyWithdrawn` of `amount` from `account`.
pub fn withdrawn(account: &str, amount: u64) -> Event<LedgerEvent> {
    Event::new(LedgerEvent::Withdrawn(MoneyWithdrawn {
        account: account.to_string(),
        amount,
    }))
}

/// A named stream that no other test uses, so suites can share a database.
pub fn unique_stream(label: &str) -> Stream {
    Stream::named(format!("{label}-{}", Uuid::now_v7()))
        .expect("generated stream names are always valid")
}

fn event_type(name: &str) -> EventType {
    EventType::try_new(name).expect("fixture event types are valid")
}

/// A record with a JSON body, created now.
pub fn record(name: &str) -> Record {
    record_at(name, Timestamp::now())
}

/// A record with a JSON body, created at `created_at`.
pub fn record_at(name: &str, created_at: Timestamp) -> Record {
    let event_id = EventId::generate();
    Record::new(
        event_id,
        event_type(name),
        serde_json::to_vec(&serde_json::json!({ "id": event_id.to_string() }))
            .unwrap_or_default(),
        b"{}".to_vec(),
        created_at,
    )
}

/// `count` fresh records of type `name`.
pub fn records(name: &str, count: usize) -> Vec<Record> {
    (0..count).map(|_| record(name)).collect()
}

/// The ids of `records`, in order.
pub fn ids(records: &[Record]) -> Vec<EventId> {
    records.iter().map(|record| record.event_id).collect()
}
