mod cache_tests;
mod index_tests;
