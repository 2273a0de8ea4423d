mod util;

use ios_kernel::IpcSignal;
use proptest::prelude::*;
use util::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_request_gets_exactly_one_reply_in_request_order(
        delays in proptest::collection::vec(0u32..50_000, 1..20),
        advance_steps in proptest::collection::vec(1u64..200_000, 1..8),
    ) {
        let mut h = Harness::new(registry_with(vec![echo("/dev/echo")]));
        let fd = h.open_settled(0x100, "/dev/echo") as u32;

        let blocks: Vec<u32> = (0..delays.len() as u32).map(|i| 0x1000 + i * 0x40).collect();
        for (block, delay) in blocks.iter().zip(&delays) {
            h.ioctl(*block, fd, *block, *delay);
        }
        for step in advance_steps {
            h.kernel.advance(step);
        }
        h.settle();

        let replies: Vec<u32> = h.replies().into_iter().skip(1).collect();
        prop_assert_eq!(&replies, &blocks);
        for block in &blocks {
            prop_assert_eq!(h.return_value(*block), *block as i32);
        }

        // Each request is acknowledged exactly once as well.
        let acks = h
            .signals()
            .iter()
            .filter(|s| matches!(s, IpcSignal::Ack(addr) if blocks.contains(addr)))
            .count();
        prop_assert_eq!(acks, blocks.len());
    }

    #[test]
    fn lowest_free_handle_is_always_chosen(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
        let mut h = Harness::new(registry_with(vec![echo("/dev/echo")]));
        let mut open: Vec<u32> = Vec::new();
        for (i, do_open) in ops.into_iter().enumerate() {
            let block = 0x100 + i as u32 * 0x40;
            if do_open || open.is_empty() {
                let expected = (0u32..).find(|fd| !open.contains(fd)).unwrap();
                let fd = h.open_settled(block, "/dev/echo");
                if expected < ios_kernel::IPC_MAX_FDS as u32 {
                    prop_assert_eq!(fd, expected as i32);
                    open.push(expected);
                } else {
                    prop_assert_eq!(fd, ios_kernel::ReturnCode::FdExhausted.code());
                }
            } else {
                let fd = open.remove(i % open.len());
                h.close(block, fd);
                h.settle();
                prop_assert_eq!(h.return_value(block), 0);
            }
        }
        prop_assert_eq!(h.kernel.handles().len(), open.len());
    }
}
