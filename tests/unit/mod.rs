mod counter_tests;
mod list_tests;
mod queue_tests;
mod store_tests;
