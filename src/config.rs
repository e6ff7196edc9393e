use std::{
    net::{IpAddr, Ipv6Addr},
    num::NonZero,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;

// CLI configuration for burrow.
#[derive(Debug, Parser, PartialEq)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// File path to the server's host key. If missing, it will be created for you.
    #[arg(long, default_value_os = "./server_key", value_name = "FILE")]
    pub key: PathBuf,

    /// File containing the public keys of authorized users, in OpenSSH
    /// authorized_keys format. Re-read on every authentication attempt,
    /// so edits take effect without a restart.
    #[arg(long, default_value_os = "./authorized_keys", value_name = "FILE")]
    pub authorized_keys_file: PathBuf,

    /// Address to listen for SSH connections.
    #[arg(
        long,
        default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        value_name = "ADDRESS"
    )]
    pub listen_address: IpAddr,

    /// Port to listen for SSH connections.
    #[arg(long, default_value_t = NonZero::new(2222).unwrap(), value_name = "PORT")]
    pub port: NonZero<u16>,

    /// How long to wait between liveness probes sent to clients holding
    /// remote forwards.
    #[arg(
        long,
        default_value = "5s",
        value_parser = parse_duration,
        value_name = "DURATION"
    )]
    pub keepalive_interval: Duration,

    /// How many unanswered probes to tolerate before a client is declared
    /// dead and its forwards are reclaimed.
    #[arg(long, default_value_t = 1, value_name = "COUNT")]
    pub keepalive_max: usize,
}

fn parse_duration(value: &str) -> anyhow::Result<Duration> {
    Ok(humantime::Duration::from_str(value)
        .map_err(|err| anyhow::anyhow!("invalid duration: {}", err))?
        .into())
}

#[cfg(test)]
mod config_tests {
    use std::{
        net::{IpAddr, Ipv4Addr, Ipv6Addr},
        path::PathBuf,
        time::Duration,
    };

    use clap::Parser;

    use super::ApplicationConfig;

    #[test_log::test]
    fn parses_default_config() {
        let config = ApplicationConfig::try_parse_from(["burrow"]).unwrap();
        assert_eq!(
            config,
            ApplicationConfig {
                key: PathBuf::from("./server_key"),
                authorized_keys_file: PathBuf::from("./authorized_keys"),
                listen_address: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                port: 2222.try_into().unwrap(),
                keepalive_interval: Duration::from_secs(5),
                keepalive_max: 1,
            }
        )
    }

    #[test_log::test]
    fn parses_custom_config() {
        let config = ApplicationConfig::try_parse_from([
            "burrow",
            "--key=/etc/burrow/host_key",
            "--authorized-keys-file=/etc/burrow/authorized_keys",
            "--listen-address=127.0.0.1",
            "--port=2022",
            "--keepalive-interval=10s",
            "--keepalive-max=3",
        ])
        .unwrap();
        assert_eq!(
            config,
            ApplicationConfig {
                key: PathBuf::from("/etc/burrow/host_key"),
                authorized_keys_file: PathBuf::from("/etc/burrow/authorized_keys"),
                listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 2022.try_into().unwrap(),
                keepalive_interval: Duration::from_secs(10),
                keepalive_max: 3,
            }
        )
    }

    #[test_log::test]
    fn fails_to_parse_if_invalid_duration() {
        assert!(ApplicationConfig::try_parse_from(["burrow", "--keepalive-interval=42"]).is_err());
    }

    #[test_log::test]
    fn fails_to_parse_if_port_is_zero() {
        assert!(ApplicationConfig::try_parse_from(["burrow", "--port=0"]).is_err());
    }
}
