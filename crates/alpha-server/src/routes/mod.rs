pub mod cluster;
pub mod events;
pub mod ops;
pub mod participants;
pub mod tcc;
pub mod transactions;
pub mod undeliverable;
