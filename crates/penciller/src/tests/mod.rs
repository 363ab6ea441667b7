mod compaction_tests;
mod helpers;
mod read_tests;
