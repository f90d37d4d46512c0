//! Pure routing of rumqttc events
//!
//! Every inbound PUBLISH becomes an [`InboundMessage`] for the topic router;
//! everything else only affects connection state.

use crate::transport::InboundMessage;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage::new(
                    String::from_utf8_lossy(&publish.topic).into_owned(),
                    publish.payload.clone(),
                )),
                Packet::Disconnect(_) => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived(InboundMessage),
    /// MQTT broker disconnected
    Disconnected,
    /// Subscription confirmed
    SubscriptionConfirmed { packet_id: u16 },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, ConnectReturnCode, Publish};
    use rumqttc::v5::mqttbytes::QoS;

    #[test]
    fn test_publish_becomes_inbound_message() {
        let publish = Publish::new(
            "$aws/things/t/jobs/notify",
            QoS::AtLeastOnce,
            br#"{"jobs":{}}"#.to_vec(),
            None,
        );
        let event = Event::Incoming(Packet::Publish(publish));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived(message) => {
                assert_eq!(message.topic, "$aws/things/t/jobs/notify");
                assert_eq!(&message.payload[..], br#"{"jobs":{}}"#);
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn test_connack_is_acknowledged() {
        let connack = ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        };
        assert!(matches!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::ConnAck(connack))),
            EventRoute::ConnectionAcknowledged
        ));
    }
}
