//! Property-based tests for the wire protocol and buffer transfers.
#![cfg(feature = "host")]

use std::mem::discriminant;

use dfagb::config::{STATE_BUSY, STATE_IDLE};
use dfagb::fsm::on_word;
use dfagb::host::{Link, LinkConfig};
use dfagb::protocol::{Command, PARAM_MASK};
use dfagb::sim::{Loopback, NoDelay, SimCart};
use dfagb::{Buffer, DeviceContext, DeviceState};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn upload_download_round_trip(words in prop::collection::vec(any::<u32>(), 1..512)) {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let mut link = Link::new(Loopback::new(&ctx, SimCart::new(1)), NoDelay, LinkConfig::default());

        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        link.upload(&bytes).unwrap();
        let mut back = vec![0u8; bytes.len()];
        link.download(&mut back).unwrap();
        prop_assert_eq!(back, bytes);
        prop_assert_eq!(ctx.state(), DeviceState::Idle);
    }

    #[test]
    fn decode_depends_only_on_top_byte(tag in 1u8.., a in 0u32..=PARAM_MASK, b in 0u32..=PARAM_MASK) {
        let high = (tag as u32) << 24;
        let x = Command::decode(high | a);
        let y = Command::decode(high | b);
        prop_assert_eq!(discriminant(&x), discriminant(&y));
    }

    #[test]
    fn idle_reply_is_idle_busy_or_prefetch(word in any::<u32>()) {
        let mut buf = Buffer::new();
        let ctx = DeviceContext::new(&mut buf);
        let reply = on_word(&ctx, word);

        match Command::decode(word) {
            Command::Download { .. } => prop_assert_eq!(reply, 0),
            Command::Read => prop_assert_eq!(reply, 0),
            cmd if cmd.is_worker() => {
                prop_assert_eq!(reply, STATE_BUSY);
                prop_assert_eq!(ctx.state(), DeviceState::WorkerBusy);
            }
            Command::Upload { .. } => prop_assert_eq!(reply, STATE_IDLE),
            _ => {
                prop_assert_eq!(reply, STATE_IDLE);
                prop_assert_eq!(ctx.state(), DeviceState::Idle);
            }
        }
    }
}
