mod util;

use ios_usb::oh0::IOCTLV_BLKMSG;
use proptest::prelude::*;
use util::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn each_request_gets_its_own_completion_whatever_the_order(
        order in Just((0..8usize).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let mut h = UsbHarness::new();
        let fd = h.open(0x100, WIIMOTE_NODE) as u32;

        let blocks: Vec<u32> = (0..8u32).map(|i| 0x400 + i * 0x200).collect();
        for (i, block) in blocks.iter().enumerate() {
            let data = 0xa000 + i as u32 * 0x40;
            h.ioctlv(*block, fd, IOCTLV_BLKMSG, &bulk_args(0x82, 32), &[(data, 32)]);
        }
        h.settle();
        let ids = h.host.pending_ids();
        prop_assert_eq!(ids.len(), blocks.len());

        for &i in &order {
            h.host.complete(ids[i], &vec![i as u8; i + 1]);
            h.kernel.advance(1);
        }
        h.settle();

        for (i, block) in blocks.iter().enumerate() {
            prop_assert_eq!(h.return_value(*block), i as i32 + 1);
            let data = 0xa000 + i as u32 * 0x40;
            prop_assert_eq!(h.read(data, i + 1), vec![i as u8; i + 1]);
        }
    }
}
