//! SQL for reads described by a [`SpecificationResult`].
//!
//! Named streams are read through their memberships and ordered by position;
//! the global stream is read from the events table and ordered by its serial
//! id. Time-sorted reads order by `(time, ordinal)`, and cursors compare
//! against that same key so that pagination is stable.

use chrono::{DateTime, Utc};
use eventstash::specification::{Direction, SpecificationResult, TimeBound, TimeColumn};
use eventstash::types::{EventId, Stream};
use sqlx::{Postgres, QueryBuilder};

pub(crate) const COLUMNS: &str =
    "e.event_id, e.event_type, e.data, e.metadata, e.created_at, e.valid_at";

/// Where a cursor event sits in a read's order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CursorKey {
    pub(crate) ordinal: i64,
    pub(crate) time: DateTime<Utc>,
}

const fn ordinal(stream: &Stream) -> &'static str {
    match stream {
        Stream::Global => "e.id",
        Stream::Named(_) => "s.position",
    }
}

const fn time_column(column: TimeColumn) -> &'static str {
    match column {
        TimeColumn::CreatedAt => "e.created_at",
        TimeColumn::ValidAt => "e.valid_at",
    }
}

fn push_source(builder: &mut QueryBuilder<'static, Postgres>, stream: &Stream) {
    match stream {
        Stream::Global => {
            builder.push(" FROM event_store_events e WHERE TRUE");
        }
        Stream::Named(name) => {
            builder
                .push(
                    " FROM event_store_streams s \
                     JOIN event_store_events e ON e.event_id = s.event_id \
                     WHERE s.stream = ",
                )
                .push_bind(name.to_string());
        }
    }
}

/// Builds the statement that locates `event_id` within `specification`'s stream.
pub(crate) fn cursor(
    specification: &SpecificationResult,
    event_id: EventId,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("SELECT ");
    builder
        .push(ordinal(&specification.stream))
        .push(" AS ordinal, ")
        .push(time_column(specification.time_column()))
        .push(" AS sort_time");
    push_source(&mut builder, &specification.stream);
    builder
        .push(" AND e.event_id = ")
        .push_bind(event_id.into_inner());
    builder
}

pub(crate) struct ReadQuery<'a> {
    specification: &'a SpecificationResult,
    start: Option<CursorKey>,
    stop: Option<CursorKey>,
}

impl<'a> ReadQuery<'a> {
    pub(crate) const fn new(
        specification: &'a SpecificationResult,
        start: Option<CursorKey>,
        stop: Option<CursorKey>,
    ) -> Self {
        Self {
            specification,
            start,
            stop,
        }
    }

    pub(crate) fn select(&self) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(COLUMNS);
        self.push_body(&mut builder);
        builder
    }

    pub(crate) fn count(&self) -> QueryBuilder<'static, Postgres> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) AS matched FROM (SELECT e.event_id");
        self.push_body(&mut builder);
        builder.push(") AS matching");
        builder
    }

    fn push_body(&self, builder: &mut QueryBuilder<'static, Postgres>) {
        let specification = self.specification;
        push_source(builder, &specification.stream);

        if let Some(event_types) = &specification.event_types {
            let names: Vec<String> = event_types.iter().map(ToString::to_string).collect();
            builder
                .push(" AND e.event_type = ANY(")
                .push_bind(names)
                .push(")");
        }
        if let Some(event_ids) = &specification.event_ids {
            let ids: Vec<uuid::Uuid> = event_ids.iter().map(|id| id.into_inner()).collect();
            builder.push(" AND e.event_id = ANY(").push_bind(ids).push(")");
        }

        let filtered = time_column(specification.time_column());
        for bound in &specification.time_bounds {
            let (operator, time) = match *bound {
                TimeBound::OlderThan(time) => (" < ", time),
                TimeBound::OlderThanOrEqual(time) => (" <= ", time),
                TimeBound::NewerThan(time) => (" > ", time),
                TimeBound::NewerThanOrEqual(time) => (" >= ", time),
            };
            builder
                .push(" AND ")
                .push(filtered)
                .push(operator)
                .push_bind(time.into_datetime());
        }

        let (after, before) = match specification.direction {
            Direction::Forward => (" > ", " < "),
            Direction::Backward => (" < ", " > "),
        };
        if let Some(key) = self.start {
            self.push_cursor(builder, after, key);
        }
        if let Some(key) = self.stop {
            self.push_cursor(builder, before, key);
        }

        let direction = match specification.direction {
            Direction::Forward => " ASC",
            Direction::Backward => " DESC",
        };
        builder.push(" ORDER BY ");
        if let Some(column) = specification.time_sort {
            builder.push(time_column(column)).push(direction).push(", ");
        }
        builder
            .push(ordinal(&specification.stream))
            .push(direction);

        if let Some(limit) = specification.limit {
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
    }

    fn push_cursor(
        &self,
        builder: &mut QueryBuilder<'static, Postgres>,
        operator: &str,
        key: CursorKey,
    ) {
        let stream = &self.specification.stream;
        builder.push(" AND ");
        match self.specification.time_sort {
            Some(column) => {
                builder
                    .push("(")
                    .push(time_column(column))
                    .push(", ")
                    .push(ordinal(stream))
                    .push(")")
                    .push(operator)
                    .push("(")
                    .push_bind(key.time)
                    .push(", ")
                    .push_bind(key.ordinal)
                    .push(")");
            }
            None => {
                builder
                    .push(ordinal(stream))
                    .push(operator)
                    .push_bind(key.ordinal);
            }
        }
    }
}
