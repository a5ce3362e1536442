//! Pure connection configuration for the MQTT driver
//!
//! Parses connection names, builds rumqttc options and maps MQTT level
//! failures onto broker reason codes. Nothing here performs I/O.

use crate::transport::driver::{ConnectOptions, DriverError, PutOutcome};
use crate::transport::reason::ReasonCode;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, PubAckReason, SubscribeReasonCode};
use rumqttc::v5::{ConnectionError, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Default port when a connection name carries none
pub const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Prefix under which point-to-point queues are mapped onto topics
pub const QUEUE_TOPIC_PREFIX: &str = "queue/";

/// Network endpoint parsed from a connection name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `host(port)`, `host`, or an `mqtt://` / `mqtts://` URL
pub fn parse_connection_name(connection_name: &str) -> Result<Endpoint, DriverError> {
    let invalid = || {
        DriverError::new(
            ReasonCode::HOST_NOT_AVAILABLE,
            format!("invalid connection name {connection_name}"),
        )
    };

    let trimmed = connection_name.trim();
    if trimmed.contains("://") {
        let url = Url::parse(trimmed).map_err(|_| invalid())?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(invalid()),
        };
        let host = url.host_str().ok_or_else(invalid)?.to_string();
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
        return Ok(Endpoint { host, port, tls });
    }

    match trimmed.split_once('(') {
        Some((host, rest)) => {
            let port = rest
                .strip_suffix(')')
                .and_then(|p| p.trim().parse::<u16>().ok())
                .ok_or_else(invalid)?;
            if host.is_empty() {
                return Err(invalid());
            }
            Ok(Endpoint {
                host: host.to_string(),
                port,
                tls: false,
            })
        }
        None if !trimmed.is_empty() => Ok(Endpoint {
            host: trimmed.to_string(),
            port: DEFAULT_PORT,
            tls: false,
        }),
        None => Err(invalid()),
    }
}

/// Build rumqttc options for one client connection
pub fn configure_mqtt_options(
    manager: &str,
    options: &ConnectOptions,
) -> Result<MqttOptions, DriverError> {
    let endpoint = parse_connection_name(&options.binding.connection_name)?;

    // Unique client id per connection so concurrent calls never steal sessions
    let client_id = format!(
        "{}-{}-{}",
        options.application_name,
        manager,
        Uuid::new_v4().simple()
    );
    let mut mqtt_options = MqttOptions::new(client_id, endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if !options.credentials.user.is_empty() {
        mqtt_options.set_credentials(
            options.credentials.user.clone(),
            options.credentials.password.clone(),
        );
    }

    mqtt_options.set_keep_alive(Duration::from_secs(60));
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(256 * 1024));
    // Publications are acknowledged when a get hands them out
    mqtt_options.set_manual_acks(true);

    Ok(mqtt_options)
}

/// Topic that carries messages for a queue
pub fn queue_topic(queue: &str) -> String {
    format!("{QUEUE_TOPIC_PREFIX}{queue}")
}

/// Shared subscription filter consuming a queue; one member of the group
/// receives each message
pub fn shared_queue_filter(group: &str, queue: &str) -> String {
    format!("$share/{group}/{}", queue_topic(queue))
}

/// Strip a `$share/<group>/` prefix so a filter can be matched locally
pub fn match_filter(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
        .map_or(filter, |(_, topic)| topic)
}

/// Map an event loop failure during connect onto a reason code
pub fn connect_reason(error: &ConnectionError) -> ReasonCode {
    match error {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
                ReasonCode::NOT_AUTHORIZED
            }
            ConnectReturnCode::ServerUnavailable | ConnectReturnCode::ServerBusy => {
                ReasonCode::Q_MGR_NOT_AVAILABLE
            }
            _ => ReasonCode::Q_MGR_NAME_ERROR,
        },
        ConnectionError::Io(_) | ConnectionError::Timeout(_) => ReasonCode::HOST_NOT_AVAILABLE,
        _ => ReasonCode::CONNECTION_BROKEN,
    }
}

/// Map a SubAck reason onto a reason code; `None` means granted
pub fn suback_reason(code: &SubscribeReasonCode) -> Option<ReasonCode> {
    match code {
        SubscribeReasonCode::Success(_) => None,
        SubscribeReasonCode::NotAuthorized => Some(ReasonCode::NOT_AUTHORIZED),
        SubscribeReasonCode::TopicFilterInvalid => Some(ReasonCode::UNKNOWN_OBJECT_NAME),
        _ => Some(ReasonCode::GET_INHIBITED),
    }
}

/// Map a PubAck reason onto a put outcome
pub fn puback_outcome(reason: &PubAckReason) -> Result<PutOutcome, ReasonCode> {
    match reason {
        PubAckReason::Success => Ok(PutOutcome::Delivered),
        PubAckReason::NoMatchingSubscribers => Ok(PutOutcome::NoSubscribersMatched),
        PubAckReason::NotAuthorized => Err(ReasonCode::NOT_AUTHORIZED),
        PubAckReason::TopicNameInvalid => Err(ReasonCode::UNKNOWN_OBJECT_NAME),
        PubAckReason::QuotaExceeded => Err(ReasonCode::Q_FULL),
        _ => Err(ReasonCode::PUT_INHIBITED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::driver::{ClientBinding, Credentials};

    fn options(connection_name: &str) -> ConnectOptions {
        ConnectOptions {
            binding: ClientBinding {
                connection_name: connection_name.to_string(),
                channel_name: "DEV.APP.SVRCONN".to_string(),
            },
            credentials: Credentials {
                user: "app".to_string(),
                password: "passw0rd".to_string(),
            },
            application_name: "ibmmq".to_string(),
        }
    }

    #[test]
    fn test_parse_host_and_port() {
        assert_eq!(
            parse_connection_name("localhost(1414)").unwrap(),
            Endpoint {
                host: "localhost".to_string(),
                port: 1414,
                tls: false
            }
        );
        assert_eq!(parse_connection_name("broker").unwrap().port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_urls() {
        let plain = parse_connection_name("mqtt://broker:1884").unwrap();
        assert_eq!(plain.port, 1884);
        assert!(!plain.tls);

        let tls = parse_connection_name("mqtts://broker").unwrap();
        assert_eq!(tls.port, 8883);
        assert!(tls.tls);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_connection_name("").is_err());
        assert!(parse_connection_name("host(notaport)").is_err());
        assert!(parse_connection_name("(1414)").is_err());
        assert!(parse_connection_name("http://broker").is_err());
    }

    #[test]
    fn test_configure_options() {
        let configured = configure_mqtt_options("QM1", &options("localhost(1414)")).unwrap();
        assert_eq!(configured.broker_address(), ("localhost".to_string(), 1414));
        assert!(configured.client_id().starts_with("ibmmq-QM1-"));
        assert_eq!(configured.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_queue_mapping() {
        assert_eq!(queue_topic("DEV.QUEUE.1"), "queue/DEV.QUEUE.1");
        let filter = shared_queue_filter("ibmmq", "DEV.QUEUE.1");
        assert_eq!(filter, "$share/ibmmq/queue/DEV.QUEUE.1");
        assert_eq!(match_filter(&filter), "queue/DEV.QUEUE.1");
        assert_eq!(match_filter("dev/#"), "dev/#");
    }

    #[test]
    fn test_puback_outcomes() {
        assert_eq!(
            puback_outcome(&PubAckReason::Success),
            Ok(PutOutcome::Delivered)
        );
        assert_eq!(
            puback_outcome(&PubAckReason::NoMatchingSubscribers),
            Ok(PutOutcome::NoSubscribersMatched)
        );
        assert_eq!(
            puback_outcome(&PubAckReason::NotAuthorized),
            Err(ReasonCode::NOT_AUTHORIZED)
        );
        assert_eq!(
            puback_outcome(&PubAckReason::QuotaExceeded),
            Err(ReasonCode::Q_FULL)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_maps_to_host_not_available() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(
            connect_reason(&ConnectionError::Timeout(elapsed)),
            ReasonCode::HOST_NOT_AVAILABLE
        );

        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(
            connect_reason(&ConnectionError::Io(refused)),
            ReasonCode::HOST_NOT_AVAILABLE
        );
    }
}
