//! End-to-end runs of a distributor and its receivers over an in-memory group.

use std::fs;
use std::io::Write;
use std::path::Path;

use blockcast_core::{
    Datagram, Distributor, DistributorConfig, Error, FramingError, HostIdentity, Message,
    MessageType, Payload, Receiver, ReceiverConfig, Role, BLOCK_SIZE,
};
use rand::seq::SliceRandom;
use tracing::Span;

fn source(dir: &Path, len: usize) -> std::path::PathBuf {
    let path = dir.join("source.bin");
    let mut f = fs::File::create(&path).unwrap();
    let data: Vec<u8> = (0..len).map(|i| (i * 31 % 253) as u8).collect();
    f.write_all(&data).unwrap();
    path
}

fn distributor(src: &Path, dest: &Path) -> Distributor {
    Distributor::open(
        HostIdentity::new(1),
        src,
        dest.to_string_lossy(),
        DistributorConfig::default(),
        Span::none(),
    )
    .unwrap()
}

fn receiver(id: u32, staging: &Path) -> Receiver {
    let config = ReceiverConfig {
        staging_dir: staging.to_path_buf(),
        exit_when_synced: true,
        ..ReceiverConfig::default()
    };
    Receiver::new(HostIdentity::new(id), config, Span::none()).unwrap()
}

fn block_num(datagram: &Datagram) -> Option<u32> {
    match Message::decode(datagram).unwrap()?.payload {
        Payload::Block { block, .. } => Some(block.block_num()),
        _ => None,
    }
}

/// Exchange datagrams until nobody has anything left to send. Every datagram
/// reaches every member, the sender included; `lose` drops one for everyone.
fn settle(
    d: &mut Distributor,
    receivers: &mut [Receiver],
    shuffle: bool,
    lose: &mut dyn FnMut(&Datagram) -> bool,
) {
    loop {
        d.pump().unwrap();
        let mut traffic = Vec::new();
        while let Some(datagram) = d.pop_outbound() {
            traffic.push(datagram);
        }
        for r in receivers.iter_mut() {
            while let Some(datagram) = r.pop_outbound() {
                traffic.push(datagram);
            }
        }
        if traffic.is_empty() {
            return;
        }
        if shuffle {
            traffic.shuffle(&mut rand::thread_rng());
        }
        for datagram in traffic {
            if lose(&datagram) {
                continue;
            }
            let delivered = Datagram::parse(datagram.as_bytes().to_vec()).unwrap();
            d.handle_datagram(&delivered).unwrap();
            for r in receivers.iter_mut() {
                r.handle_datagram(&delivered).unwrap();
            }
        }
    }
}

/// Probe until the distributor has no participants left.
fn finish(d: &mut Distributor, receivers: &mut [Receiver], lose: &mut dyn FnMut(&Datagram) -> bool) {
    for _ in 0..10 {
        if d.is_finished() {
            return;
        }
        d.on_idle().unwrap();
        settle(d, receivers, false, lose);
    }
    panic!("distributor never finished");
}

#[test]
fn shuffled_delivery_synchronizes() {
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), 3 * BLOCK_SIZE + 17);
    let dest = dir.path().join("copy/out.bin");
    let mut d = distributor(&src, &dest);
    let mut rs = vec![receiver(10, dir.path())];

    settle(&mut d, &mut rs, true, &mut |_| false);
    assert!(rs[0].transfer(d.file()).unwrap().is_byte_complete());
    assert!(!d.is_finished());

    finish(&mut d, &mut rs, &mut |_| false);
    assert!(rs[0].is_synchronized(d.file()));
    assert!(rs[0].transfer(d.file()).is_none());
    assert!(rs[0].is_finished());
    assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());
}

#[test]
fn lost_block_and_info_are_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), 4 * BLOCK_SIZE);
    let dest = dir.path().join("recovered.bin");
    let mut d = distributor(&src, &dest);
    let mut rs = vec![receiver(10, dir.path())];

    let mut lost_info = false;
    let mut lost_block = false;
    let mut lose = |datagram: &Datagram| {
        if datagram.tag() == MessageType::Info.tag() && !lost_info {
            lost_info = true;
            return true;
        }
        if block_num(datagram) == Some(1) && !lost_block {
            lost_block = true;
            return true;
        }
        false
    };
    settle(&mut d, &mut rs, false, &mut lose);
    let state = rs[0].transfer(d.file()).unwrap();
    assert_eq!(state.remaining_blocks(), 1);
    assert!(state.destination().is_none());

    finish(&mut d, &mut rs, &mut lose);
    assert!(rs[0].is_synchronized(d.file()));
    assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());
}

#[test]
fn shared_loss_is_repaired_by_one_rebroadcast() {
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), 3 * BLOCK_SIZE);
    let dest = dir.path().join("shared.bin");
    let mut d = distributor(&src, &dest);
    let mut rs = vec![receiver(10, dir.path()), receiver(11, dir.path())];

    let mut block_two_sent = 0;
    let mut lose = |datagram: &Datagram| {
        if block_num(datagram) == Some(2) {
            block_two_sent += 1;
            return block_two_sent == 1;
        }
        false
    };
    settle(&mut d, &mut rs, false, &mut lose);
    finish(&mut d, &mut rs, &mut lose);

    assert_eq!(block_two_sent, 2);
    for r in &rs {
        assert!(r.is_synchronized(d.file()));
    }
    assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());
}

#[test]
fn duplicated_delivery_is_harmless() {
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), 2 * BLOCK_SIZE + 5);
    let dest = dir.path().join("dup.bin");
    let mut d = distributor(&src, &dest);
    let mut r = receiver(10, dir.path());

    let mut traffic = Vec::new();
    d.pump().unwrap();
    while let Some(datagram) = d.pop_outbound() {
        traffic.push(datagram);
    }
    for datagram in traffic.iter().chain(traffic.iter()).rev() {
        r.handle_datagram(datagram).unwrap();
    }
    let state = r.transfer(d.file()).unwrap();
    assert!(state.is_byte_complete());
    assert_eq!(fs::read(&dest).unwrap(), fs::read(&src).unwrap());
}

#[test]
fn empty_file_completes_from_info_alone() {
    let dir = tempfile::tempdir().unwrap();
    let src = source(dir.path(), 0);
    let dest = dir.path().join("empty.bin");
    let mut d = distributor(&src, &dest);
    assert_eq!(d.file().block_count(), 0);
    let mut rs = vec![receiver(10, dir.path())];

    settle(&mut d, &mut rs, false, &mut |_| false);
    finish(&mut d, &mut rs, &mut |_| false);
    assert!(rs[0].is_synchronized(d.file()));
    assert_eq!(fs::read(&dest).unwrap().len(), 0);
}

#[test]
fn malformed_datagrams_are_rejected() {
    let mut bytes = Message::new(
        HostIdentity::new(3),
        Payload::Hello {
            host: HostIdentity::new(3),
        },
    )
    .encode()
    .unwrap()
    .as_bytes()
    .to_vec();
    bytes.push(0);
    assert!(matches!(
        Datagram::parse(bytes),
        Err(FramingError::LengthMismatch { .. })
    ));

    let dir = tempfile::tempdir().unwrap();
    let mut r = receiver(10, dir.path());
    let wrong_layout = Datagram::with_metadata(
        MessageType::Block.tag(),
        HostIdentity::new(3),
        &HostIdentity::new(3),
    );
    assert!(matches!(
        r.handle_datagram(&wrong_layout),
        Err(Error::Framing(FramingError::MetadataSize { .. }))
    ));
}
