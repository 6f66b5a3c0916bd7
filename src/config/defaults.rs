use ipnetwork::IpNetwork;

// Helper defaults kept private to the config module.
pub(crate) fn default_method() -> String {
    "aes-256-ctr".to_string()
}

pub(crate) fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

pub(crate) fn default_status_whitelist() -> Vec<IpNetwork> {
    vec![
        IpNetwork::V4("127.0.0.1/32".parse().expect("valid loopback network")),
        IpNetwork::V6("::1/128".parse().expect("valid loopback network")),
    ]
}

pub(crate) fn default_client_read_timeout() -> u64 {
    300
}

pub(crate) fn default_connect_timeout() -> u64 {
    10
}

pub(crate) fn default_flush_interval_secs() -> u64 {
    14
}

pub(crate) fn default_failsafe_log() -> String {
    "dbfail.log".to_string()
}

pub(crate) fn default_max_connections() -> u32 {
    70
}

pub(crate) fn default_min_connections() -> u32 {
    10
}
