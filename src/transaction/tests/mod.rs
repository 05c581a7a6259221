//! Client transaction state machine tests against loopback stub servers,
//! run with compressed timer bases.

mod test_client_transaction;
