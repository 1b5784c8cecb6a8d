mod helpers;
mod replication_tests;
mod state_tests;
