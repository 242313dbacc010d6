//! Translation from stored configurations to `rumqttc` connection options.
//! Shared by the probe and the live session so both dial a broker the same way.

use crate::models::{BrokerConfig, BrokerEndpoint, Protocol};
use rumqttc::{MqttOptions, NetworkOptions, QoS, Transport};
use std::time::Duration;

pub fn mqtt_options(config: &BrokerConfig, endpoint: &BrokerEndpoint, client_id: &str) -> MqttOptions {
    // Websocket transports take the full URL as broker address.
    let broker_addr = if endpoint.protocol.is_websocket() {
        endpoint.url()
    } else {
        endpoint.host.clone()
    };

    let mut options = MqttOptions::new(client_id, broker_addr, endpoint.port);
    options.set_keep_alive(Duration::from_secs(u64::from(config.keepalive)));
    options.set_clean_session(config.clean_session);

    if let Some(username) = config.username.as_deref() {
        let password = config.password.as_ref().map(|p| p.expose()).unwrap_or("");
        options.set_credentials(username, password);
    }

    options.set_transport(transport_for(endpoint.protocol));
    options
}

/// rumqttc counts its connect timeout (TCP, TLS and the CONNACK wait) in
/// whole seconds. Rounds up so the effective timeout is never shorter.
pub fn network_options(connect_timeout: Duration) -> NetworkOptions {
    let secs = connect_timeout.as_secs() + u64::from(connect_timeout.subsec_nanos() > 0);
    let mut options = NetworkOptions::new();
    options.set_connection_timeout(secs.max(1));
    options
}

fn transport_for(protocol: Protocol) -> Transport {
    match protocol {
        Protocol::Mqtt => Transport::Tcp,
        Protocol::Mqtts => Transport::tls_with_default_config(),
        Protocol::Ws => Transport::Ws,
        Protocol::Wss => Transport::wss_with_default_config(),
    }
}

pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewBrokerConfig;
    use time::OffsetDateTime;

    #[test]
    fn options_carry_session_parameters() {
        let mut config = NewBrokerConfig::new("broker.local", 1884)
            .with_credentials("user", "pw")
            .into_config(1, OffsetDateTime::now_utc())
            .unwrap();
        config.keepalive = 15;
        config.clean_session = false;

        let options = mqtt_options(&config, &config.primary_endpoint(), "probe-1");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert!(!options.clean_session());
        assert_eq!(options.client_id(), "probe-1");
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn websocket_endpoints_use_the_url_as_address() {
        let config = NewBrokerConfig::new("broker.local", 8083)
            .with_protocol(Protocol::Ws)
            .into_config(1, OffsetDateTime::now_utc())
            .unwrap();
        let options = mqtt_options(&config, &config.primary_endpoint(), "c");
        assert_eq!(options.broker_address().0, "ws://broker.local:8083/mqtt");
    }

    #[test]
    fn connect_timeout_rounds_up_to_whole_seconds() {
        assert_eq!(network_options(Duration::from_secs(11)).connection_timeout(), 11);
        assert_eq!(network_options(Duration::from_millis(30_001)).connection_timeout(), 31);
        assert_eq!(network_options(Duration::from_millis(200)).connection_timeout(), 1);
        assert_eq!(network_options(Duration::ZERO).connection_timeout(), 1);
    }

    #[test]
    fn qos_levels_map_onto_rumqttc() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
    }
}
