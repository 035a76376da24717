pub mod noise_server;
pub mod ws_mock;
