//! AT command strings and response markers for SIM7600-family modems

/// Wake probe, answered with OK
pub const PROBE: &str = "AT";
/// Turn command echo off
pub const ECHO_OFF: &str = "ATE0";
/// SIM status query
pub const SIM_STATUS: &str = "AT+CPIN?";
/// Packet service attach query
pub const ATTACH_STATUS: &str = "AT+CGATT?";
/// Open the network bearer
pub const BEARER_OPEN: &str = "AT+NETOPEN";
/// Close the network bearer
pub const BEARER_CLOSE: &str = "AT+NETCLOSE";
/// Local IP address query
pub const IP_ADDRESS: &str = "AT+IPADDR";

/// Response to `SIM_STATUS` when the SIM is usable
pub const SIM_READY: &str = "+CPIN: READY";
/// Response to `ATTACH_STATUS` when attached
pub const ATTACHED: &str = "+CGATT: 1";
/// Response to `BEARER_OPEN` on success
pub const BEARER_OPENED: &str = "+NETOPEN: 0";
/// Character the modem prints when it is ready for payload bytes
pub const SEND_PROMPT: &str = ">";

/// Line terminator appended to every command
pub const TERMINATOR: &str = "\r\n";

/// Configure PDP context 1 with `apn`
pub fn define_context(apn: &str) -> String {
    format!("AT+CGDCONT=1,\"IP\",\"{}\"", apn)
}

/// Open TCP socket `socket_id` to `host:port`
pub fn socket_open(socket_id: u8, host: &str, port: u16) -> String {
    format!("AT+CIPOPEN={},\"TCP\",\"{}\",{}", socket_id, host, port)
}

/// Success notification for `socket_open`
pub fn socket_opened(socket_id: u8) -> String {
    format!("+CIPOPEN: {},0", socket_id)
}

/// Announce `len` raw bytes for socket `socket_id`
pub fn send_announce(socket_id: u8, len: usize) -> String {
    format!("AT+CIPSEND={},{}", socket_id, len)
}

/// Close socket `socket_id`
pub fn socket_close(socket_id: u8) -> String {
    format!("AT+CIPCLOSE={}", socket_id)
}
