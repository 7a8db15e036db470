//! Sans-IO generation of the long-lived authorization key.
//!
//! Each step consumes the previous server reply and produces the next
//! request plus an opaque state value, so the network driving lives
//! entirely with the caller:
//!
//! ```text
//! let (req, s1) = authentication::step1()?;
//! // send req over the plaintext envelope, receive ResPQ
//! let (req, s2) = authentication::step2(s1, res_pq)?;
//! // send, receive Server_DH_Params
//! let (req, s3) = authentication::step3(s2, dh_params)?;
//! // send, receive Set_client_DH_params_answer
//! let done = authentication::finish(s3, answer)?;
//! // done.auth_key is ready; done.first_salt seeds the encrypted session
//! ```
//!
//! Every reply's nonces are checked against the values we sent; any
//! mismatch aborts the handshake.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use courier_crypto::{aes, factorize, generate_key_data_from_nonce, rsa, sha1, AuthKey};
use courier_tl::mtproto::{
    ClientDhInnerData, DhGenAnswer, PqInnerData, ReqDhParams, ReqPqMulti, ResPq,
    ServerDhParams, SetClientDhParams,
};
use courier_tl::{Cursor, Deserializable, Serializable};
use num_bigint::BigUint;

/// Errors that abort auth key generation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    InvalidNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidServerNonce { got: [u8; 16], expected: [u8; 16] },
    InvalidPqSize { size: usize },
    UnknownFingerprints { fingerprints: Vec<i64> },
    DhParamsFail,
    EncryptedResponseNotPadded { len: usize },
    InvalidDhInnerData { error: courier_tl::deserialize::Error },
    InvalidAnswerHash,
    ValueOutOfRange { name: &'static str },
    InvalidNewNonceHash { got: [u8; 16], expected: [u8; 16] },
    DhGenRetry,
    DhGenFail,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidNonce { got, expected } => {
                write!(f, "nonce mismatch: got {got:?}, expected {expected:?}")
            }
            Self::InvalidServerNonce { got, expected } => {
                write!(f, "server_nonce mismatch: got {got:?}, expected {expected:?}")
            }
            Self::InvalidPqSize { size } => write!(f, "pq size {size} invalid (expected 8)"),
            Self::UnknownFingerprints { fingerprints } => {
                write!(f, "no known key among fingerprints {fingerprints:?}")
            }
            Self::DhParamsFail => write!(f, "server rejected DH parameters"),
            Self::EncryptedResponseNotPadded { len } => {
                write!(f, "encrypted answer length {len} is not 16-byte aligned")
            }
            Self::InvalidDhInnerData { error } => {
                write!(f, "server_DH_inner_data: {error}")
            }
            Self::InvalidAnswerHash => write!(f, "answer hash mismatch"),
            Self::ValueOutOfRange { name } => write!(f, "{name} outside the safe range"),
            Self::InvalidNewNonceHash { got, expected } => {
                write!(f, "new_nonce_hash mismatch: got {got:?}, expected {expected:?}")
            }
            Self::DhGenRetry => write!(f, "server requested a DH retry"),
            Self::DhGenFail => write!(f, "server reported DH failure"),
        }
    }
}

// ─── Step state ──────────────────────────────────────────────────────────────

/// State after [`step1`].
pub struct Step1 {
    nonce: [u8; 16],
}

/// State after [`step2`].
pub struct Step2 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
}

/// State after [`step3`].
pub struct Step3 {
    nonce: [u8; 16],
    server_nonce: [u8; 16],
    new_nonce: [u8; 32],
    g_ab: BigUint,
    time_offset: i32,
}

/// Output of a completed handshake.
#[derive(Clone, Debug, PartialEq)]
pub struct Finished {
    /// The 256-byte authorization key.
    pub auth_key: [u8; 256],
    /// Clock skew in seconds relative to the server.
    pub time_offset: i32,
    /// The first server salt, derived from the exchanged nonces.
    pub first_salt: i64,
}

// ─── Step 1: req_pq_multi ────────────────────────────────────────────────────

/// Open the handshake with a random client nonce.
pub fn step1() -> Result<(ReqPqMulti, Step1), Error> {
    let mut nonce = [0u8; 16];
    courier_crypto::random_bytes(&mut nonce);
    do_step1(&nonce)
}

fn do_step1(random: &[u8; 16]) -> Result<(ReqPqMulti, Step1), Error> {
    let nonce = *random;
    Ok((ReqPqMulti { nonce }, Step1 { nonce }))
}

// ─── Step 2: req_DH_params ───────────────────────────────────────────────────

/// Consume `ResPQ`: factor the challenge, pick a known server key, and build
/// the RSA-encrypted `p_q_inner_data`.
pub fn step2(state: Step1, response: ResPq) -> Result<(ReqDhParams, Step2), Error> {
    let mut random = [0u8; 288];
    courier_crypto::random_bytes(&mut random);
    do_step2(state, response, &random)
}

fn do_step2(
    state: Step1,
    response: ResPq,
    random: &[u8; 288],
) -> Result<(ReqDhParams, Step2), Error> {
    let Step1 { nonce } = state;
    check_nonce(&response.nonce, &nonce)?;

    if response.pq.len() != 8 {
        return Err(Error::InvalidPqSize {
            size: response.pq.len(),
        });
    }
    let pq = u64::from_be_bytes(response.pq.as_slice().try_into().unwrap());
    let (p, q) = factorize(pq);

    let mut new_nonce = [0u8; 32];
    new_nonce.copy_from_slice(&random[..32]);
    let rsa_padding: &[u8; 256] = random[32..].try_into().unwrap();

    let p_bytes = trim_be(p);
    let q_bytes = trim_be(q);

    let inner = PqInnerData {
        pq: pq.to_be_bytes().to_vec(),
        p: p_bytes.clone(),
        q: q_bytes.clone(),
        nonce,
        server_nonce: response.server_nonce,
        new_nonce,
    }
    .to_bytes();

    let fingerprint = response
        .server_public_key_fingerprints
        .iter()
        .copied()
        .find(|&fp| key_for_fingerprint(fp).is_some())
        .ok_or(Error::UnknownFingerprints {
            fingerprints: response.server_public_key_fingerprints.clone(),
        })?;
    let key = key_for_fingerprint(fingerprint).unwrap();

    let encrypted_data = rsa::encrypt_hashed(&inner, &key, rsa_padding);

    Ok((
        ReqDhParams {
            nonce,
            server_nonce: response.server_nonce,
            p: p_bytes,
            q: q_bytes,
            public_key_fingerprint: fingerprint,
            encrypted_data,
        },
        Step2 {
            nonce,
            server_nonce: response.server_nonce,
            new_nonce,
        },
    ))
}

fn trim_be(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().position(|&b| b != 0).unwrap_or(7);
    bytes[skip..].to_vec()
}

// ─── Step 3: set_client_DH_params ────────────────────────────────────────────

/// Consume `Server_DH_Params`: decrypt the inner answer, validate it, and
/// produce our half of the exchange.
pub fn step3(state: Step2, response: ServerDhParams) -> Result<(SetClientDhParams, Step3), Error> {
    let mut random = [0u8; 272];
    courier_crypto::random_bytes(&mut random);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i32;
    do_step3(state, response, &random, now)
}

fn do_step3(
    state: Step2,
    response: ServerDhParams,
    random: &[u8; 272],
    now: i32,
) -> Result<(SetClientDhParams, Step3), Error> {
    let Step2 {
        nonce,
        server_nonce,
        new_nonce,
    } = state;

    let mut ok = match response {
        ServerDhParams::Fail(fail) => {
            check_nonce(&fail.nonce, &nonce)?;
            check_server_nonce(&fail.server_nonce, &server_nonce)?;
            let digest = sha1!(new_nonce);
            let mut expected = [0u8; 16];
            expected.copy_from_slice(&digest[4..]);
            check_new_nonce_hash(&fail.new_nonce_hash, &expected)?;
            return Err(Error::DhParamsFail);
        }
        ServerDhParams::Ok(ok) => ok,
    };

    check_nonce(&ok.nonce, &nonce)?;
    check_server_nonce(&ok.server_nonce, &server_nonce)?;

    if ok.encrypted_answer.len() % 16 != 0 {
        return Err(Error::EncryptedResponseNotPadded {
            len: ok.encrypted_answer.len(),
        });
    }

    let (key, iv) = generate_key_data_from_nonce(&server_nonce, &new_nonce);
    aes::ige_decrypt(&mut ok.encrypted_answer, &key, &iv);
    let plain = ok.encrypted_answer;

    if plain.len() < 20 {
        return Err(Error::InvalidAnswerHash);
    }
    let got_hash: [u8; 20] = plain[..20].try_into().unwrap();
    let mut cursor = Cursor::from_slice(&plain[20..]);
    let inner = courier_tl::mtproto::ServerDhInnerData::deserialize(&mut cursor)
        .map_err(|error| Error::InvalidDhInnerData { error })?;
    let inner_len = cursor.pos();
    if got_hash != sha1!(&plain[20..20 + inner_len]) {
        return Err(Error::InvalidAnswerHash);
    }

    check_nonce(&inner.nonce, &nonce)?;
    check_server_nonce(&inner.server_nonce, &server_nonce)?;

    let dh_prime = BigUint::from_bytes_be(&inner.dh_prime);
    let g = BigUint::from(inner.g as u32);
    let g_a = BigUint::from_bytes_be(&inner.g_a);
    let time_offset = inner.server_time - now;

    let b = BigUint::from_bytes_be(&random[..256]);
    let g_b = g.modpow(&b, &dh_prime);
    let g_ab = g_a.modpow(&b, &dh_prime);

    // 1 < g, g_a, g_b < dh_prime - 1; and the exchanged values must stay
    // 2^{2048-64} away from both ends.
    let one = BigUint::from(1u32);
    check_in_range("g", &g, &one, &(&dh_prime - &one))?;
    check_in_range("g_a", &g_a, &one, &(&dh_prime - &one))?;
    check_in_range("g_b", &g_b, &one, &(&dh_prime - &one))?;
    let margin = &one << (2048 - 64);
    check_in_range("g_a", &g_a, &margin, &(&dh_prime - &margin))?;
    check_in_range("g_b", &g_b, &margin, &(&dh_prime - &margin))?;

    let client_inner = ClientDhInnerData {
        nonce,
        server_nonce,
        retry_id: 0,
        g_b: g_b.to_bytes_be(),
    }
    .to_bytes();

    let digest = sha1!(&client_inner);
    let pad_len = (16 - (20 + client_inner.len()) % 16) % 16;

    let mut hashed = Vec::with_capacity(20 + client_inner.len() + pad_len);
    hashed.extend_from_slice(&digest);
    hashed.extend_from_slice(&client_inner);
    hashed.extend_from_slice(&random[256..256 + pad_len]);

    aes::ige_encrypt(&mut hashed, &key, &iv);

    Ok((
        SetClientDhParams {
            nonce,
            server_nonce,
            encrypted_data: hashed,
        },
        Step3 {
            nonce,
            server_nonce,
            new_nonce,
            g_ab,
            time_offset,
        },
    ))
}

// ─── Finish ──────────────────────────────────────────────────────────────────

/// Consume the server's confirmation and derive the final key.
pub fn finish(state: Step3, response: DhGenAnswer) -> Result<Finished, Error> {
    let Step3 {
        nonce,
        server_nonce,
        new_nonce,
        g_ab,
        time_offset,
    } = state;

    let (body, number) = match &response {
        DhGenAnswer::Ok(body) => (body, 1u8),
        DhGenAnswer::Retry(body) => (body, 2),
        DhGenAnswer::Fail(body) => (body, 3),
    };

    check_nonce(&body.nonce, &nonce)?;
    check_server_nonce(&body.server_nonce, &server_nonce)?;

    let mut key_bytes = [0u8; 256];
    let g_ab_bytes = g_ab.to_bytes_be();
    key_bytes[256 - g_ab_bytes.len()..].copy_from_slice(&g_ab_bytes);

    let auth_key = AuthKey::from_bytes(key_bytes);
    let expected = auth_key.new_nonce_hash(&new_nonce, number);
    check_new_nonce_hash(&body.new_nonce_hash, &expected)?;

    match response {
        DhGenAnswer::Ok(_) => Ok(Finished {
            auth_key: key_bytes,
            time_offset,
            first_salt: first_salt(&new_nonce, &server_nonce),
        }),
        DhGenAnswer::Retry(_) => Err(Error::DhGenRetry),
        DhGenAnswer::Fail(_) => Err(Error::DhGenFail),
    }
}

fn first_salt(new_nonce: &[u8; 32], server_nonce: &[u8; 16]) -> i64 {
    let mut salt = [0u8; 8];
    for ((dst, a), b) in salt.iter_mut().zip(new_nonce).zip(server_nonce) {
        *dst = a ^ b;
    }
    i64::from_le_bytes(salt)
}

// ─── Checks ──────────────────────────────────────────────────────────────────

fn check_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidNonce {
            got: *got,
            expected: *expected,
        })
    }
}

fn check_server_nonce(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidServerNonce {
            got: *got,
            expected: *expected,
        })
    }
}

fn check_new_nonce_hash(got: &[u8; 16], expected: &[u8; 16]) -> Result<(), Error> {
    if got == expected {
        Ok(())
    } else {
        Err(Error::InvalidNewNonceHash {
            got: *got,
            expected: *expected,
        })
    }
}

fn check_in_range(
    name: &'static str,
    value: &BigUint,
    low: &BigUint,
    high: &BigUint,
) -> Result<(), Error> {
    if low < value && value < high {
        Ok(())
    } else {
        Err(Error::ValueOutOfRange { name })
    }
}

// ─── Server keys ─────────────────────────────────────────────────────────────

/// Look up a built-in server public key by its fingerprint.
pub fn key_for_fingerprint(fingerprint: i64) -> Option<rsa::Key> {
    known_keys().find(|key| key.fingerprint() == fingerprint)
}

/// Fingerprints of every built-in server key.
pub fn known_fingerprints() -> Vec<i64> {
    known_keys().map(|key| key.fingerprint()).collect()
}

pub(crate) fn known_keys() -> impl Iterator<Item = rsa::Key> {
    // Production and test DC keys, in that order.
    [
        rsa::Key::new(
            "29379598170669337022986177149456128565388431120058863768162556424047512191330847455146576344487764408661701890505066208632169112269581063774293102577308490531282748465986139880977280302242772832972539403531316010870401287642763009136156734339538042419388722777357134487746169093539093850251243897188928735903389451772730245253062963384108812842079887538976360465290946139638691491496062099570836476454855996319192747663615955633778034897140982517446405334423701359108810182097749467210509584293428076654573384828809574217079944388301239431309115013843331317877374435868468779972014486325557807783825502498215169806323",
            "65537",
        ),
        rsa::Key::new(
            "25342889448840415564971689590713473206898847759084779052582026594546022463853940585885215951168491965708222649399180603818074200620463776135424884632162512403163793083921641631564740959529419359595852941166848940585952337613333022396096584117954892216031229237302943701877588456738335398602461675225081791820393153757504952636234951323237820036543581047826906120927972487366805292115792231423684261262330394324750785450942589751755390156647751460719351439969059949569615302809050721500330239005077889855323917509948255722081644689442127297605422579707142646660768825302832201908302295573257427896031830742328565032949",
            "65537",
        ),
    ]
    .into_iter()
    .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_tl::mtproto::{DhGen, ServerDhParamsOk};
    use courier_tl::Identifiable;

    const NONCE: [u8; 16] = [1u8; 16];
    const SERVER_NONCE: [u8; 16] = [2u8; 16];
    const SERVER_TIME: i32 = 1_700_000_000;
    const LOCAL_TIME: i32 = 1_699_999_000;

    fn step2_random() -> [u8; 288] {
        let mut random = [0u8; 288];
        random
            .iter_mut()
            .enumerate()
            .for_each(|(i, x)| *x = (i % 251) as u8);
        random
    }

    fn step3_random() -> [u8; 272] {
        let mut random = [0u8; 272];
        random
            .iter_mut()
            .enumerate()
            .for_each(|(i, x)| *x = (i.wrapping_mul(7) % 253) as u8);
        random
    }

    fn dh_prime_bytes() -> Vec<u8> {
        vec![0xFF; 256]
    }

    fn g_a_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; 256];
        bytes[0] = 0x80;
        bytes
    }

    fn scripted_res_pq() -> ResPq {
        ResPq {
            nonce: NONCE,
            server_nonce: SERVER_NONCE,
            pq: 0x17ED48941A08F981u64.to_be_bytes().to_vec(),
            server_public_key_fingerprints: vec![known_fingerprints()[0]],
        }
    }

    fn scripted_dh_params(new_nonce: &[u8; 32]) -> ServerDhParams {
        let mut inner = Vec::new();
        courier_tl::mtproto::ServerDhInnerData::CONSTRUCTOR_ID.serialize(&mut inner);
        inner.extend_from_slice(&NONCE);
        inner.extend_from_slice(&SERVER_NONCE);
        3i32.serialize(&mut inner);
        dh_prime_bytes().serialize(&mut inner);
        g_a_bytes().serialize(&mut inner);
        SERVER_TIME.serialize(&mut inner);

        let digest = sha1!(&inner);
        let mut answer = Vec::new();
        answer.extend_from_slice(&digest);
        answer.extend_from_slice(&inner);
        while answer.len() % 16 != 0 {
            answer.push(0);
        }

        let (key, iv) = generate_key_data_from_nonce(&SERVER_NONCE, new_nonce);
        aes::ige_encrypt(&mut answer, &key, &iv);

        ServerDhParams::Ok(ServerDhParamsOk {
            nonce: NONCE,
            server_nonce: SERVER_NONCE,
            encrypted_answer: answer,
        })
    }

    #[test]
    fn full_handshake_against_scripted_server() {
        let (req1, s1) = do_step1(&NONCE).unwrap();
        assert_eq!(req1.nonce, NONCE);

        let random2 = step2_random();
        let (req2, s2) = do_step2(s1, scripted_res_pq(), &random2).unwrap();
        assert_eq!(req2.p, vec![0x49, 0x4C, 0x55, 0x3B]);
        assert_eq!(req2.q, vec![0x53, 0x91, 0x10, 0x73]);
        assert_eq!(req2.public_key_fingerprint, known_fingerprints()[0]);
        assert_eq!(req2.encrypted_data.len(), 256);

        let new_nonce: [u8; 32] = random2[..32].try_into().unwrap();
        let random3 = step3_random();
        let (req3, s3) =
            do_step3(s2, scripted_dh_params(&new_nonce), &random3, LOCAL_TIME).unwrap();
        assert_eq!(s3.time_offset, SERVER_TIME - LOCAL_TIME);

        // Replay the server's view of set_client_DH_params: the decrypted
        // blob must be the SHA1-prefixed client_DH_inner_data carrying
        // g_b = g^b mod dh_prime.
        let prime = BigUint::from_bytes_be(&dh_prime_bytes());
        let b = BigUint::from_bytes_be(&random3[..256]);
        let g_b = BigUint::from(3u32).modpow(&b, &prime);
        let expected_inner = ClientDhInnerData {
            nonce: NONCE,
            server_nonce: SERVER_NONCE,
            retry_id: 0,
            g_b: g_b.to_bytes_be(),
        }
        .to_bytes();

        let (key, iv) = generate_key_data_from_nonce(&SERVER_NONCE, &new_nonce);
        let mut decrypted = req3.encrypted_data.clone();
        aes::ige_decrypt(&mut decrypted, &key, &iv);
        assert_eq!(&decrypted[..20], &sha1!(&expected_inner));
        assert_eq!(&decrypted[20..20 + expected_inner.len()], &expected_inner[..]);

        // The server confirms; both sides now hold g_ab.
        let g_ab = BigUint::from_bytes_be(&g_a_bytes()).modpow(&b, &prime);
        let mut key_bytes = [0u8; 256];
        let g_ab_bytes = g_ab.to_bytes_be();
        key_bytes[256 - g_ab_bytes.len()..].copy_from_slice(&g_ab_bytes);
        let auth_key = AuthKey::from_bytes(key_bytes);

        let answer = DhGenAnswer::Ok(DhGen {
            nonce: NONCE,
            server_nonce: SERVER_NONCE,
            new_nonce_hash: auth_key.new_nonce_hash(&new_nonce, 1),
        });
        let done = finish(s3, answer).unwrap();

        assert_eq!(done.auth_key, key_bytes);
        assert_eq!(done.time_offset, SERVER_TIME - LOCAL_TIME);
        let mut expected_salt = [0u8; 8];
        for (i, dst) in expected_salt.iter_mut().enumerate() {
            *dst = new_nonce[i] ^ SERVER_NONCE[i];
        }
        assert_eq!(done.first_salt, i64::from_le_bytes(expected_salt));
    }

    #[test]
    fn step2_rejects_echoed_nonce_mismatch() {
        let (_, s1) = do_step1(&NONCE).unwrap();
        let mut res_pq = scripted_res_pq();
        res_pq.nonce[0] ^= 1;
        assert!(matches!(
            do_step2(s1, res_pq, &step2_random()),
            Err(Error::InvalidNonce { .. })
        ));
    }

    #[test]
    fn step2_rejects_unknown_fingerprints() {
        let (_, s1) = do_step1(&NONCE).unwrap();
        let mut res_pq = scripted_res_pq();
        res_pq.server_public_key_fingerprints = vec![0x1234];
        assert!(matches!(
            do_step2(s1, res_pq, &step2_random()),
            Err(Error::UnknownFingerprints { .. })
        ));
    }

    #[test]
    fn finish_rejects_bad_new_nonce_hash() {
        let s3 = Step3 {
            nonce: NONCE,
            server_nonce: SERVER_NONCE,
            new_nonce: [9u8; 32],
            g_ab: BigUint::from(12345u32),
            time_offset: 0,
        };
        let answer = DhGenAnswer::Ok(DhGen {
            nonce: NONCE,
            server_nonce: SERVER_NONCE,
            new_nonce_hash: [0u8; 16],
        });
        assert!(matches!(
            finish(s3, answer),
            Err(Error::InvalidNewNonceHash { .. })
        ));
    }
}
