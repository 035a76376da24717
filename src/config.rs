use std::time::Duration;

/// Connection settings for the websocket transport and query layer.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Websocket endpoint for the chat transport.
    pub websocket_url: String,
    /// Max wait for the socket open + handshake phase.
    pub connect_timeout: Duration,
    /// Default wait for iq replies matched by id.
    pub default_query_timeout: Duration,
    /// Optional Origin header sent with the websocket upgrade.
    pub origin: Option<String>,
    /// Browser triple reported in the pairing payload: name, platform, release.
    pub browser: (String, String, String),
    /// Client version advertised during the handshake.
    pub version: [u32; 3],
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            websocket_url: "wss://web.whatsapp.com/ws/chat".to_owned(),
            connect_timeout: Duration::from_millis(20_000),
            default_query_timeout: Duration::from_millis(60_000),
            origin: Some("https://web.whatsapp.com".to_owned()),
            browser: (
                "Wha.ts".to_owned(),
                "Desktop".to_owned(),
                "0.1".to_owned(),
            ),
            version: [2, 3000, 1021636778],
        }
    }
}

impl SocketConfig {
    /// Returns the dotted version string used for the registration build hash.
    pub fn version_string(&self) -> String {
        format!("{}.{}.{}", self.version[0], self.version[1], self.version[2])
    }
}
