use std::env;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Stack configuration. Every field can be overridden from the
/// environment so an interposed, unmodified application can still be
/// pointed at a different device or address.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the TUN device the stack attaches to.
    pub ifname: String,
    /// Local address; also the source of every emitted datagram.
    pub addr: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ifname: "tun0".to_string(),
            addr: Ipv4Addr::new(10, 0, 0, 4),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        }
    }
}

impl Config {
    /// Reads `USERNET_IFNAME`, `USERNET_ADDR` and `USERNET_NETMASK`,
    /// falling back to the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(name) = env::var("USERNET_IFNAME") {
            if !name.is_empty() {
                cfg.ifname = name;
            }
        }
        if let Some(addr) = env::var("USERNET_ADDR")
            .ok()
            .and_then(|s| Ipv4Addr::from_str(&s).ok())
        {
            cfg.addr = addr;
        }
        if let Some(mask) = env::var("USERNET_NETMASK")
            .ok()
            .and_then(|s| Ipv4Addr::from_str(&s).ok())
        {
            cfg.netmask = mask;
        }

        cfg
    }
}
