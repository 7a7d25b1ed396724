mod common;
mod test_machine;
mod test_saga;
mod test_server;
mod test_workers;
