//! Helpers shared by the integration suites

#![allow(dead_code)]

use driftmq::broker::{Broker, ClientLink};
use driftmq::protocol::{
    Connect, Packet, PubAck, Publish, QoS, Subscribe, Subscription, SubscriptionOptions,
};

/// Every packet currently waiting on the outbound channel
pub fn drain(link: &mut ClientLink) -> Vec<Packet> {
    std::iter::from_fn(|| link.outbound.try_recv().ok()).collect()
}

pub fn publishes(packets: Vec<Packet>) -> Vec<Publish> {
    packets
        .into_iter()
        .filter_map(|p| match p {
            Packet::Publish(p) => Some(p),
            _ => None,
        })
        .collect()
}

pub fn payloads(publishes: &[Publish]) -> Vec<String> {
    publishes
        .iter()
        .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
        .collect()
}

/// Connect with clean start and discard the CONNACK
pub async fn connect(broker: &Broker, client_id: &str) -> ClientLink {
    connect_with(broker, Connect::new(client_id)).await
}

pub async fn connect_with(broker: &Broker, connect: Connect) -> ClientLink {
    let mut link = broker.connect(connect).await.unwrap();
    match drain(&mut link).first() {
        Some(Packet::ConnAck(_)) => {}
        other => panic!("expected CONNACK, got {:?}", other),
    }
    link
}

pub async fn subscribe(link: &mut ClientLink, filter: &str, options: SubscriptionOptions) {
    subscribe_with_id(link, filter, options, None).await;
}

pub async fn subscribe_with_id(
    link: &mut ClientLink,
    filter: &str,
    options: SubscriptionOptions,
    subscription_id: Option<u32>,
) -> Vec<Packet> {
    let mut packet = Subscribe::new(1, vec![Subscription::new(filter, options)]);
    packet.properties.subscription_identifiers = subscription_id.into_iter().collect();
    link.connection.handle(Packet::Subscribe(packet)).await.unwrap();
    let mut packets = drain(link);
    match packets.first() {
        Some(Packet::SubAck(suback)) => {
            assert!(
                suback.reason_codes.iter().all(|rc| !rc.is_error()),
                "subscription refused: {:?}",
                suback.reason_codes
            );
        }
        other => panic!("expected SUBACK, got {:?}", other),
    }
    packets.remove(0);
    packets
}

pub fn publish(topic: &str, payload: &str, qos: QoS) -> Publish {
    Publish::new(topic, payload.to_string(), qos)
}

/// Publish from a connected client, filling in a packet id for QoS > 0
pub async fn client_publish(link: &mut ClientLink, mut publish: Publish, packet_id: u16) {
    if publish.qos != QoS::AtMostOnce {
        publish.packet_id = Some(packet_id);
    }
    link.connection.handle(Packet::Publish(publish)).await.unwrap();
}

pub async fn puback(link: &mut ClientLink, packet_id: u16) {
    link.connection
        .handle(Packet::PubAck(PubAck::new(packet_id)))
        .await
        .unwrap();
}
