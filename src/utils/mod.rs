pub mod number_seq;
