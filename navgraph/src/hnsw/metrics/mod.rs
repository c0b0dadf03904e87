pub mod ops_counter;
