pub mod display_queue;
