//! Stream → scanner → assembler → product queue, end to end.

use noaaport::frames::{CAT_TEXT, STREAM_NWSTG};
use noaaport::{AssemblerConfig, Ingester, ProductSpec, StreamBuilder, FOS_PREFIX_LEN};
use pq::{Pq, Signature};

fn text_payload(n: u32, body_len: usize) -> Vec<u8> {
    let mut out = format!("\x01\r\r\n{:03} \r\r\n", n % 1000).into_bytes();
    assert_eq!(out.len(), FOS_PREFIX_LEN);
    out.extend_from_slice(format!("SDUS53 KARX {:06}\r\r\n", n).as_bytes());
    out.extend((0..body_len).map(|i| b'A' + ((i + n as usize) % 26) as u8));
    out
}

fn spec(n: u32, fragments: usize) -> ProductSpec {
    ProductSpec {
        prod_seqno: n,
        stream: STREAM_NWSTG,
        category: CAT_TEXT,
        payload: text_payload(n, 600),
        fragments,
        compressed: false,
        with_ccb: false,
    }
}

#[test]
fn twenty_products_reach_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let pq = Pq::create(&dir.path().join("np.pq"), 64, 1 << 20, 0o600).unwrap();

    let mut b = StreamBuilder::new(1);
    for n in 0..20 {
        b.push_product(&spec(n, 3));
        if n % 5 == 0 {
            b.push_time_frame();
        }
    }
    let stream = b.finish();

    let mut ingester = Ingester::new(&pq, stream.as_slice(), AssemblerConfig::default());
    ingester.run().unwrap();

    assert_eq!(ingester.inserted, 20);
    assert_eq!(ingester.assembler.stats.products, 20);
    assert_eq!(ingester.assembler.stats.aborted_products, 0);
    assert_eq!(pq.stats().unwrap().n_products, 20);
}

#[test]
fn dropped_block_loses_exactly_one_product() {
    // Twenty products of three fragments; block #2 (the middle frame) of
    // product #7 never arrives.
    let dir = tempfile::tempdir().unwrap();
    let pq = Pq::create(&dir.path().join("np.pq"), 64, 1 << 20, 0o600).unwrap();

    let mut b = StreamBuilder::new(1);
    let mut stream = Vec::new();
    for n in 0..20 {
        let frames = b.product_frames(&spec(n, 3));
        for (i, frame) in frames.into_iter().enumerate() {
            if n == 7 && i == 1 {
                continue; // the lost block
            }
            stream.extend_from_slice(&frame);
        }
    }

    let aborted = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut ingester = Ingester::new(&pq, stream.as_slice(), AssemblerConfig::default());
    {
        let aborted = std::sync::Arc::clone(&aborted);
        ingester
            .assembler
            .on_abort_retransmit(move |seqno| aborted.lock().unwrap().push(seqno));
    }
    ingester.run().unwrap();

    assert_eq!(ingester.inserted, 19);
    assert_eq!(ingester.assembler.stats.aborted_products, 1);
    assert_eq!(ingester.assembler.stats.missed_frames, 1);
    assert_eq!(*aborted.lock().unwrap(), vec![7]);
    assert_eq!(pq.stats().unwrap().n_products, 19);
}

#[test]
fn duplicate_product_is_counted_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let pq = Pq::create(&dir.path().join("np.pq"), 64, 1 << 20, 0o600).unwrap();

    let mut b = StreamBuilder::new(1);
    b.push_product(&spec(1, 2));
    b.push_product(&spec(1, 2)); // byte-identical payload → same signature
    let stream = b.finish();

    let mut ingester = Ingester::new(&pq, stream.as_slice(), AssemblerConfig::default());
    ingester.run().unwrap();

    assert_eq!(ingester.inserted, 1);
    assert_eq!(ingester.duplicates, 1);
    assert_eq!(pq.stats().unwrap().n_products, 1);
}

#[test]
fn signatures_are_deterministic_for_a_given_stream() {
    let build = || {
        let mut b = StreamBuilder::new(1);
        for n in 0..5 {
            b.push_product(&spec(n, 2));
        }
        b.finish()
    };

    let collect_sigs = |stream: &[u8]| -> Vec<Signature> {
        let dir = tempfile::tempdir().unwrap();
        let pq = Pq::create(&dir.path().join("np.pq"), 64, 1 << 20, 0o600).unwrap();
        let mut ingester = Ingester::new(&pq, stream, AssemblerConfig::default());
        ingester.run().unwrap();
        let mut sigs = Vec::new();
        while pq
            .sequence(
                pq::CursorMode::Gt,
                &pq::ProductClass::everything(),
                |info, _| sigs.push(info.signature),
            )
            .unwrap()
            == pq::Seq::Advanced
        {}
        sigs
    };

    let a = collect_sigs(&build());
    let b = collect_sigs(&build());
    assert_eq!(a, b);
    assert_eq!(a.len(), 5);
}

#[test]
fn garbage_between_frames_is_survived() {
    let dir = tempfile::tempdir().unwrap();
    let pq = Pq::create(&dir.path().join("np.pq"), 64, 1 << 20, 0o600).unwrap();

    let mut b = StreamBuilder::new(1);
    b.push_product(&spec(0, 1));
    b.push_raw(&[0x00, 0x13, 0x37, 0xFF, 0x00]); // noise with a fake sentinel
    b.push_product(&spec(1, 1));
    let stream = b.finish();

    let mut ingester = Ingester::new(&pq, stream.as_slice(), AssemblerConfig::default());
    ingester.run().unwrap();
    assert_eq!(ingester.inserted, 2);
}
