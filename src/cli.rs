use clap::Parser;

use sipcap::publisher::MqttConfig;

/// Passive SIP signaling capture: watches an interface, reassembles and
/// filters SIP messages, and publishes them as JSON envelopes over MQTT.
#[derive(Parser, Debug)]
#[command(name = "sipcap", version)]
pub struct Cli {
    /// Logging level (debug, info, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Interface for pcap to capture from
    #[arg(long, env = "INTERFACE", default_value = "lo")]
    pub interface: String,

    /// pcap BPF packet selection filter
    #[arg(long, env = "BPF_FILTER", default_value = "udp and port 5060")]
    pub bpf_filter: String,

    /// SIP selection filter (s-expression DSL; empty passes everything)
    #[arg(long, env = "SIP_FILTER", default_value = "")]
    pub sip_filter: String,

    /// IP:port to bind for the /metrics endpoint (disabled when empty)
    #[arg(long = "metric-filter", env = "METRICS_ADDR", default_value = "")]
    pub metrics_addr: String,

    /// MQTT broker url (tcp:// or ssl://)
    #[arg(long, env = "BROKER", default_value = "tcp://localhost:1883")]
    pub broker: String,

    /// MQTT client ID (generated when empty)
    #[arg(long, env = "CLIENT_ID", default_value = "")]
    pub client_id: String,

    /// MQTT publishing topic for SIP data
    #[arg(long, env = "TOPIC", default_value = "")]
    pub topic: String,

    /// MQTT publishing topic for telemetry (disabled when empty)
    #[arg(long, env = "TELEMETRY_TOPIC", default_value = "")]
    pub telemetry_topic: String,

    /// MQTT TLS key file (pem)
    #[arg(long, env = "KEY_FILE", default_value = "")]
    pub key_file: String,

    /// MQTT TLS cert file (pem)
    #[arg(long, env = "CERT_FILE", default_value = "")]
    pub cert_file: String,
}

impl Cli {
    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            broker: self.broker.clone(),
            client_id: self.client_id.clone(),
            topic: self.topic.clone(),
            telemetry_topic: self.telemetry_topic.clone(),
            key_file: self.key_file.clone(),
            cert_file: self.cert_file.clone(),
        }
    }
}
