use courier_crypto::{encrypt_data_v2_as, DequeBuffer, Direction};
use courier_mtproto::{EncryptedSession, PlainSession};
use courier_tl::mtproto::Ping;
use courier_tl::Serializable;

fn test_key_bytes() -> [u8; 256] {
    let mut data = [0u8; 256];
    data.iter_mut().enumerate().for_each(|(i, x)| *x = i as u8);
    data
}

#[test]
fn plain_session_wraps_calls_in_the_plaintext_envelope() {
    let mut session = PlainSession::new();
    let wire = session.pack(&Ping { ping_id: 99 }).to_bytes();

    // auth_key_id(8) + msg_id(8) + len(4) + constructor(4) + ping_id(8)
    assert_eq!(wire.len(), 32);
    assert_eq!(&wire[..8], &[0u8; 8]);
    assert_eq!(u32::from_le_bytes(wire[16..20].try_into().unwrap()), 12);
}

#[test]
fn plain_session_msg_ids_increase() {
    let mut session = PlainSession::new();
    let first = session.pack(&Ping { ping_id: 1 }).msg_id;
    let second = session.pack(&Ping { ping_id: 2 }).msg_id;
    assert!(second > first);
}

#[test]
fn encrypted_session_roundtrips_a_server_frame() {
    let session = EncryptedSession::with_session_id(test_key_bytes(), 7, 0, 1234);

    // Build a frame exactly as the server would.
    let body = Ping { ping_id: 5 }.to_bytes();
    let mut inner = DequeBuffer::with_capacity(32 + body.len(), 32);
    inner.extend(7i64.to_le_bytes());
    inner.extend(1234i64.to_le_bytes());
    inner.extend(0x5000_0000_0000_0004i64.to_le_bytes());
    inner.extend(3i32.to_le_bytes());
    inner.extend((body.len() as u32).to_le_bytes());
    inner.extend(body.iter().copied());
    encrypt_data_v2_as(&mut inner, session.auth_key(), Direction::FromServer);

    let mut frame = inner.into_vec();
    let opened = session.unpack(&mut frame).unwrap();
    assert_eq!(opened.salt, 7);
    assert_eq!(opened.session_id, 1234);
    assert_eq!(opened.msg_id, 0x5000_0000_0000_0004);
    assert_eq!(opened.seq_no, 3);
    assert_eq!(opened.body, body);
}

#[test]
fn encrypted_session_stamps_current_salt() {
    let mut session = EncryptedSession::with_session_id(test_key_bytes(), 7, 0, 1234);
    let before = session.next_header(true);
    assert_eq!(before.salt, 7);

    session.set_salt(0xDEADBEEF);
    let after = session.next_header(true);
    assert_eq!(after.salt, 0xDEADBEEF);
    assert!(after.msg_id > before.msg_id);
}
