use eventstash_memory::InMemoryRepository;
use eventstash_testing::repository_contract_tests;

repository_contract_tests! {
    suite = in_memory,
    make_repository = || async { InMemoryRepository::new() },
}
