//! Property-based tests for the wire formats.
//!
//! Uses proptest to verify:
//! 1. Any `Message` survives the JSON encode → decode round-trip.
//! 2. Any `SealedEnvelope` survives the data-channel text round-trip.
//! 3. Any routed `SignalMessage` survives the signaling round-trip.
//! 4. Garbage input never panics a decoder.

use peerlink_proto::codec::{self, SealedEnvelope};
use peerlink_proto::message::*;
use peerlink_proto::presence::PresenceStatus;
use peerlink_proto::signal::{self, IceCandidate, SessionDescription, SignalMessage};
use proptest::prelude::*;
use uuid::Uuid;

fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    "[a-z0-9-]{1,32}".prop_map(PeerId::new)
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<u128>().prop_map(|n| MessageId::from_uuid(Uuid::from_u128(n)))
}

fn arb_group_id() -> impl Strategy<Value = GroupId> {
    any::<u128>().prop_map(|n| GroupId::from_uuid(Uuid::from_u128(n)))
}

fn arb_recipient() -> impl Strategy<Value = Recipient> {
    prop_oneof![
        arb_peer_id().prop_map(Recipient::Peer),
        arb_group_id().prop_map(Recipient::Group),
    ]
}

fn arb_body() -> impl Strategy<Value = MessageBody> {
    prop_oneof![
        ".{0,256}".prop_map(|text| MessageBody::Chat { text }),
        any::<bool>().prop_map(|is_typing| MessageBody::TypingStatus { is_typing }),
        (arb_message_id(), ".{1,8}")
            .prop_map(|(target, emoji)| MessageBody::Reaction { target, emoji }),
        arb_message_id().prop_map(|target| MessageBody::DeleteMessage { target }),
        (arb_message_id(), ".{0,64}")
            .prop_map(|(target, text)| MessageBody::EditMessage { target, text }),
        arb_message_id().prop_map(|message_id| MessageBody::DeliveryReceipt { message_id }),
        arb_message_id().prop_map(|message_id| MessageBody::ReadReceipt { message_id }),
        (
            "[a-z0-9]{1,16}",
            prop::collection::vec(any::<u8>(), 0..128),
            any::<u32>()
        )
            .prop_map(|(file_id, data, index)| MessageBody::FileChunk {
                file_id,
                index,
                data,
            }),
        (
            arb_group_id(),
            ".{0,32}",
            prop::collection::vec(arb_peer_id(), 0..8)
        )
            .prop_map(|(group_id, name, members)| MessageBody::GroupCreated {
                group_id,
                name,
                members,
            }),
    ]
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        arb_message_id(),
        arb_peer_id(),
        arb_recipient(),
        any::<u64>(),
        proptest::option::of(arb_message_id()),
        arb_body(),
    )
        .prop_map(
            |(id, sender_id, recipient, millis, parent_message_id, body)| Message {
                id,
                sender_id,
                recipient,
                timestamp: Timestamp::from_millis(millis),
                parent_message_id,
                body,
            },
        )
}

fn arb_envelope() -> impl Strategy<Value = SealedEnvelope> {
    (
        prop::collection::vec(any::<u8>(), 0..512),
        prop::collection::vec(any::<u8>(), 12),
    )
        .prop_map(|(data, iv)| SealedEnvelope { data, iv })
}

fn arb_candidate() -> impl Strategy<Value = IceCandidate> {
    (
        ".{0,128}",
        proptest::option::of("[0-9]{1,2}"),
        proptest::option::of(any::<u16>()),
    )
        .prop_map(|(candidate, sdp_mid, sdp_mline_index)| IceCandidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        })
}

fn arb_signal() -> impl Strategy<Value = SignalMessage> {
    prop_oneof![
        (".{0,256}", arb_peer_id(), arb_peer_id()).prop_map(|(sdp, recipient_id, sender_id)| {
            SignalMessage::Offer {
                offer: SessionDescription::offer(sdp),
                recipient_id,
                sender_id,
            }
        }),
        (".{0,256}", arb_peer_id(), arb_peer_id()).prop_map(|(sdp, recipient_id, sender_id)| {
            SignalMessage::Answer {
                answer: SessionDescription::answer(sdp),
                recipient_id,
                sender_id,
            }
        }),
        (arb_candidate(), arb_peer_id(), arb_peer_id()).prop_map(
            |(candidate, recipient_id, sender_id)| SignalMessage::IceCandidate {
                candidate,
                recipient_id,
                sender_id,
            }
        ),
        (
            proptest::option::of("[a-z0-9]{1,16}".prop_map(UserId::new)),
            proptest::option::of(arb_peer_id()),
            prop_oneof![Just(PresenceStatus::Online), Just(PresenceStatus::Offline)],
        )
            .prop_map(|(user_id, peer_id, status)| SignalMessage::UserStatusChange {
                user_id,
                peer_id,
                status,
            }),
    ]
}

proptest! {
    /// Any message survives an encode → decode round-trip.
    #[test]
    fn message_round_trip(msg in arb_message()) {
        let bytes = codec::encode_message(&msg).expect("encode should succeed");
        let decoded = codec::decode_message(&bytes).expect("decode should succeed");
        prop_assert_eq!(msg, decoded);
    }

    /// Any sealed envelope survives the data-channel text form.
    #[test]
    fn envelope_round_trip(envelope in arb_envelope()) {
        let text = codec::encode_envelope(&envelope).expect("encode should succeed");
        let decoded = codec::decode_envelope(&text).expect("decode should succeed");
        prop_assert_eq!(envelope, decoded);
    }

    /// Any signaling frame survives an encode → decode round-trip.
    #[test]
    fn signal_round_trip(msg in arb_signal()) {
        let text = signal::encode(&msg).expect("encode should succeed");
        let decoded = signal::decode(&text).expect("decode should succeed");
        prop_assert_eq!(msg, decoded);
    }

    /// Overwriting the sender never changes where a frame is routed.
    #[test]
    fn with_sender_keeps_recipient(msg in arb_signal(), sender in arb_peer_id()) {
        let recipient = msg.recipient().cloned();
        let rewritten = msg.with_sender(sender.clone());
        prop_assert_eq!(rewritten.recipient().cloned(), recipient.clone());
        if recipient.is_some() {
            prop_assert_eq!(rewritten.sender(), Some(&sender));
        }
    }

    /// Random bytes never cause a panic when decoded as a message.
    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode_message(&bytes);
    }

    /// Random text never causes a panic in the envelope or signaling decoders.
    #[test]
    fn random_text_decode_no_panic(text in ".{0,512}") {
        let _ = codec::decode_envelope(&text);
        let _ = signal::decode(&text);
    }
}
