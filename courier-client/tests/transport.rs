use courier_client::{Mode, Transport, TransportError};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

async fn read_exact(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn abridged_announces_once_and_encodes_small_frames() {
    let (client_end, mut server_end) = duplex(4096);
    let mut transport = Transport::start(Mode::Abridged, client_end).await.unwrap();

    transport.write_msg(&[0x01, 0x02, 0x03, 0x04]).await.unwrap();

    assert_eq!(read_exact(&mut server_end, 1).await, vec![0xEF]);
    assert_eq!(
        read_exact(&mut server_end, 5).await,
        vec![0x01, 0x01, 0x02, 0x03, 0x04]
    );

    // A second frame must not repeat the announcement.
    transport.write_msg(&[0xAA, 0xBB, 0xCC, 0xDD]).await.unwrap();
    assert_eq!(
        read_exact(&mut server_end, 5).await,
        vec![0x01, 0xAA, 0xBB, 0xCC, 0xDD]
    );
}

#[tokio::test]
async fn abridged_large_frame_uses_extended_length() {
    let (client_end, mut server_end) = duplex(4096);
    let mut transport = Transport::start(Mode::Abridged, client_end).await.unwrap();

    let payload = vec![0xAB; 512];
    transport.write_msg(&payload).await.unwrap();

    let _announcement = read_exact(&mut server_end, 1).await;
    assert_eq!(
        read_exact(&mut server_end, 4).await,
        vec![0x7F, 0x80, 0x00, 0x00]
    );
    assert_eq!(read_exact(&mut server_end, 512).await, payload);
}

#[tokio::test]
async fn intermediate_announces_with_four_bytes() {
    let (client_end, mut server_end) = duplex(4096);
    let mut transport = Transport::start(Mode::Intermediate, client_end)
        .await
        .unwrap();

    transport.write_msg(&[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();

    assert_eq!(read_exact(&mut server_end, 4).await, vec![0xEE; 4]);
    assert_eq!(
        read_exact(&mut server_end, 4).await,
        8u32.to_le_bytes().to_vec()
    );
    assert_eq!(read_exact(&mut server_end, 8).await, vec![1, 2, 3, 4, 5, 6, 7, 8]);
}

#[tokio::test]
async fn full_mode_has_no_announcement_and_carries_crc() {
    let (client_end, mut server_end) = duplex(4096);
    let mut transport = Transport::start(Mode::Full, client_end).await.unwrap();

    transport.write_msg(&[9, 9, 9, 9, 8, 8, 8, 8]).await.unwrap();

    let header = read_exact(&mut server_end, 8).await;
    assert_eq!(&header[..4], &20u32.to_le_bytes(), "total_len includes all fields");
    assert_eq!(&header[4..], &0u32.to_le_bytes(), "first frame has seq 0");
    let _payload = read_exact(&mut server_end, 8).await;
    let _crc = read_exact(&mut server_end, 4).await;

    transport.write_msg(&[1, 1, 1, 1]).await.unwrap();
    let header = read_exact(&mut server_end, 8).await;
    assert_eq!(&header[4..], &1u32.to_le_bytes(), "seq increments per frame");
}

#[tokio::test]
async fn roundtrip_between_peer_transports() {
    for mode in [Mode::Abridged, Mode::Intermediate, Mode::Full] {
        let (client_end, server_end) = duplex(1 << 20);
        let mut client = Transport::start(mode, client_end).await.unwrap();
        let mut server = match mode {
            // Announced modes are detected; Full must be agreed upon.
            Mode::Abridged | Mode::Intermediate => Transport::detect(server_end).await.unwrap(),
            Mode::Full => Transport::start(Mode::Full, server_end).await.unwrap(),
        };
        assert_eq!(server.mode(), mode);

        for payload in [
            Vec::new(),
            vec![0x55; 8],
            vec![0x13; 1024],
            (0..=255u8).cycle().take(4096).collect::<Vec<u8>>(),
        ] {
            client.write_msg(&payload).await.unwrap();
            assert_eq!(server.read_msg().await.unwrap(), payload, "{mode:?} c->s");

            server.write_msg(&payload).await.unwrap();
            assert_eq!(client.read_msg().await.unwrap(), payload, "{mode:?} s->c");
        }
    }
}

#[tokio::test]
async fn misaligned_payloads_are_rejected() {
    for mode in [Mode::Abridged, Mode::Intermediate, Mode::Full] {
        let (client_end, _server_end) = duplex(4096);
        let mut transport = Transport::start(mode, client_end).await.unwrap();
        match transport.write_msg(&[1, 2, 3]).await {
            Err(TransportError::MisalignedPayload { len: 3 }) => {}
            other => panic!("{mode:?}: expected misaligned rejection, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn detect_classifies_announcements() {
    // Abridged.
    let (mut raw, server_end) = duplex(64);
    raw.write_all(&[0xEF]).await.unwrap();
    let transport = Transport::detect(server_end).await.unwrap();
    assert_eq!(transport.mode(), Mode::Abridged);

    // Intermediate.
    let (mut raw, server_end) = duplex(64);
    raw.write_all(&[0xEE, 0xEE, 0xEE, 0xEE]).await.unwrap();
    let transport = Transport::detect(server_end).await.unwrap();
    assert_eq!(transport.mode(), Mode::Intermediate);

    // A half-finished Intermediate announcement is ambiguous.
    let (mut raw, server_end) = duplex(64);
    raw.write_all(&[0xEE, 0xEE, 0x00, 0xEE]).await.unwrap();
    assert!(matches!(
        Transport::detect(server_end).await,
        Err(TransportError::AmbiguousModeAnnounce)
    ));

    // Anything else is unsupported.
    let (mut raw, server_end) = duplex(64);
    raw.write_all(&[0xAB]).await.unwrap();
    assert!(matches!(
        Transport::detect(server_end).await,
        Err(TransportError::ModeNotSupported)
    ));
}

#[tokio::test]
async fn four_byte_frames_surface_as_error_codes() {
    // -404 as it appears on the wire after an invalid auth key.
    let (mut raw, server_end) = duplex(64);
    let mut frame = 4u32.to_le_bytes().to_vec();
    frame.extend_from_slice(&(-404i32).to_le_bytes());
    raw.write_all(&frame).await.unwrap();

    let mut transport = Transport::start(Mode::Intermediate, server_end).await.unwrap();
    // Drain the announcement our own start() wrote into the pipe.
    let mut announcement = [0u8; 4];
    raw.read_exact(&mut announcement).await.unwrap();

    match transport.read_msg().await {
        Err(TransportError::Code(-404)) => {}
        other => panic!("expected code -404, got {other:?}"),
    }
}

#[tokio::test]
async fn corrupted_full_frame_fails_crc() {
    let (mut raw, server_end) = duplex(4096);
    let mut server = Transport::start(Mode::Full, server_end).await.unwrap();

    // total_len(4) + seq(4) + payload(8) + crc(4), with the CRC flipped.
    let mut frame = Vec::new();
    frame.extend_from_slice(&20u32.to_le_bytes());
    frame.extend_from_slice(&0u32.to_le_bytes());
    frame.extend_from_slice(&[7u8; 8]);
    frame.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
    raw.write_all(&frame).await.unwrap();

    assert!(matches!(
        server.read_msg().await,
        Err(TransportError::CrcMismatch { .. })
    ));
}
