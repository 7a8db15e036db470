//! Hand-written schema for the MTProto service layer: the key-exchange
//! constructors and the transport-level service messages every connection
//! must understand (acks, salts, containers, pings, RPC results).

use crate::deserialize::{Buffer, Error, Result};
use crate::{Deserializable, Identifiable, RemoteCall, Serializable};

fn expect_constructor(buf: Buffer, expected: u32) -> Result<()> {
    let id = u32::deserialize(buf)?;
    if id == expected {
        Ok(())
    } else {
        Err(Error::UnexpectedConstructor { id })
    }
}

// ─── Key exchange: requests ──────────────────────────────────────────────────

/// `req_pq_multi#be7e8ef1 nonce:int128 = ResPQ`
#[derive(Clone, Debug, PartialEq)]
pub struct ReqPqMulti {
    pub nonce: [u8; 16],
}

impl Identifiable for ReqPqMulti {
    const CONSTRUCTOR_ID: u32 = 0xbe7e8ef1;
}

impl Serializable for ReqPqMulti {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
    }
}

impl RemoteCall for ReqPqMulti {
    type Return = ResPq;
}

/// `req_DH_params#d712e4be nonce:int128 server_nonce:int128 p:bytes q:bytes
/// public_key_fingerprint:long encrypted_data:bytes = Server_DH_Params`
#[derive(Clone, Debug, PartialEq)]
pub struct ReqDhParams {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub public_key_fingerprint: i64,
    pub encrypted_data: Vec<u8>,
}

impl Identifiable for ReqDhParams {
    const CONSTRUCTOR_ID: u32 = 0xd712e4be;
}

impl Serializable for ReqDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.p.serialize(buf);
        self.q.serialize(buf);
        self.public_key_fingerprint.serialize(buf);
        self.encrypted_data.serialize(buf);
    }
}

impl RemoteCall for ReqDhParams {
    type Return = ServerDhParams;
}

/// `set_client_DH_params#f5045f1f nonce:int128 server_nonce:int128
/// encrypted_data:bytes = Set_client_DH_params_answer`
#[derive(Clone, Debug, PartialEq)]
pub struct SetClientDhParams {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub encrypted_data: Vec<u8>,
}

impl Identifiable for SetClientDhParams {
    const CONSTRUCTOR_ID: u32 = 0xf5045f1f;
}

impl Serializable for SetClientDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.encrypted_data.serialize(buf);
    }
}

impl RemoteCall for SetClientDhParams {
    type Return = DhGenAnswer;
}

// ─── Key exchange: replies and inner payloads ────────────────────────────────

/// `resPQ#05162463`
#[derive(Clone, Debug, PartialEq)]
pub struct ResPq {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub pq: Vec<u8>,
    pub server_public_key_fingerprints: Vec<i64>,
}

impl Identifiable for ResPq {
    const CONSTRUCTOR_ID: u32 = 0x05162463;
}

impl Deserializable for ResPq {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            nonce: <[u8; 16]>::deserialize(buf)?,
            server_nonce: <[u8; 16]>::deserialize(buf)?,
            pq: Vec::<u8>::deserialize(buf)?,
            server_public_key_fingerprints: Vec::<i64>::deserialize(buf)?,
        })
    }
}

/// `p_q_inner_data#83c95aec` — RSA-encrypted in `req_DH_params`.
#[derive(Clone, Debug, PartialEq)]
pub struct PqInnerData {
    pub pq: Vec<u8>,
    pub p: Vec<u8>,
    pub q: Vec<u8>,
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub new_nonce: [u8; 32],
}

impl Identifiable for PqInnerData {
    const CONSTRUCTOR_ID: u32 = 0x83c95aec;
}

impl Serializable for PqInnerData {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.pq.serialize(buf);
        self.p.serialize(buf);
        self.q.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.new_nonce.serialize(buf);
    }
}

/// `Server_DH_Params` — ok `#d0e8075c` or fail `#79cb045d`.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerDhParams {
    Ok(ServerDhParamsOk),
    Fail(ServerDhParamsFail),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerDhParamsOk {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub encrypted_answer: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerDhParamsFail {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub new_nonce_hash: [u8; 16],
}

impl Deserializable for ServerDhParams {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            0xd0e8075c => Ok(Self::Ok(ServerDhParamsOk {
                nonce: <[u8; 16]>::deserialize(buf)?,
                server_nonce: <[u8; 16]>::deserialize(buf)?,
                encrypted_answer: Vec::<u8>::deserialize(buf)?,
            })),
            0x79cb045d => Ok(Self::Fail(ServerDhParamsFail {
                nonce: <[u8; 16]>::deserialize(buf)?,
                server_nonce: <[u8; 16]>::deserialize(buf)?,
                new_nonce_hash: <[u8; 16]>::deserialize(buf)?,
            })),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

/// `server_DH_inner_data#b5890dba` — inside the IGE-encrypted answer.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerDhInnerData {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub g: i32,
    pub dh_prime: Vec<u8>,
    pub g_a: Vec<u8>,
    pub server_time: i32,
}

impl Identifiable for ServerDhInnerData {
    const CONSTRUCTOR_ID: u32 = 0xb5890dba;
}

impl Deserializable for ServerDhInnerData {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            nonce: <[u8; 16]>::deserialize(buf)?,
            server_nonce: <[u8; 16]>::deserialize(buf)?,
            g: i32::deserialize(buf)?,
            dh_prime: Vec::<u8>::deserialize(buf)?,
            g_a: Vec::<u8>::deserialize(buf)?,
            server_time: i32::deserialize(buf)?,
        })
    }
}

/// `client_DH_inner_data#6643b654` — IGE-encrypted into `set_client_DH_params`.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientDhInnerData {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub retry_id: i64,
    pub g_b: Vec<u8>,
}

impl Identifiable for ClientDhInnerData {
    const CONSTRUCTOR_ID: u32 = 0x6643b654;
}

impl Serializable for ClientDhInnerData {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.retry_id.serialize(buf);
        self.g_b.serialize(buf);
    }
}

/// `Set_client_DH_params_answer` — `dh_gen_ok#3bcbf734`,
/// `dh_gen_retry#46dc1fb9` or `dh_gen_fail#a69dae02`.
#[derive(Clone, Debug, PartialEq)]
pub enum DhGenAnswer {
    Ok(DhGen),
    Retry(DhGen),
    Fail(DhGen),
}

/// Common body of the three `dh_gen_*` constructors; `new_nonce_hash` is
/// hash 1, 2 or 3 depending on the variant.
#[derive(Clone, Debug, PartialEq)]
pub struct DhGen {
    pub nonce: [u8; 16],
    pub server_nonce: [u8; 16],
    pub new_nonce_hash: [u8; 16],
}

impl Deserializable for DhGenAnswer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        let body = DhGen {
            nonce: <[u8; 16]>::deserialize(buf)?,
            server_nonce: <[u8; 16]>::deserialize(buf)?,
            new_nonce_hash: <[u8; 16]>::deserialize(buf)?,
        };
        match id {
            0x3bcbf734 => Ok(Self::Ok(body)),
            0x46dc1fb9 => Ok(Self::Retry(body)),
            0xa69dae02 => Ok(Self::Fail(body)),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

// ─── Service messages ────────────────────────────────────────────────────────

/// `ping#7abe77ec ping_id:long = Pong`
#[derive(Clone, Debug, PartialEq)]
pub struct Ping {
    pub ping_id: i64,
}

impl Identifiable for Ping {
    const CONSTRUCTOR_ID: u32 = 0x7abe77ec;
}

impl Serializable for Ping {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.ping_id.serialize(buf);
    }
}

impl RemoteCall for Ping {
    type Return = Pong;
}

/// `pong#347773c5 msg_id:long ping_id:long = Pong`
#[derive(Clone, Debug, PartialEq)]
pub struct Pong {
    pub msg_id: i64,
    pub ping_id: i64,
}

impl Identifiable for Pong {
    const CONSTRUCTOR_ID: u32 = 0x347773c5;
}

impl Deserializable for Pong {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            msg_id: i64::deserialize(buf)?,
            ping_id: i64::deserialize(buf)?,
        })
    }
}

/// `msgs_ack#62d6b459 msg_ids:Vector<long> = MsgsAck`
#[derive(Clone, Debug, PartialEq)]
pub struct MsgsAck {
    pub msg_ids: Vec<i64>,
}

impl Identifiable for MsgsAck {
    const CONSTRUCTOR_ID: u32 = 0x62d6b459;
}

impl Serializable for MsgsAck {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_ids.serialize(buf);
    }
}

impl Deserializable for MsgsAck {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            msg_ids: Vec::<i64>::deserialize(buf)?,
        })
    }
}

/// `bad_msg_notification#a7eff811`
#[derive(Clone, Debug, PartialEq)]
pub struct BadMsgNotification {
    pub bad_msg_id: i64,
    pub bad_msg_seqno: i32,
    pub error_code: i32,
}

impl Identifiable for BadMsgNotification {
    const CONSTRUCTOR_ID: u32 = 0xa7eff811;
}

impl Deserializable for BadMsgNotification {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            bad_msg_id: i64::deserialize(buf)?,
            bad_msg_seqno: i32::deserialize(buf)?,
            error_code: i32::deserialize(buf)?,
        })
    }
}

/// `bad_server_salt#edab447b`
#[derive(Clone, Debug, PartialEq)]
pub struct BadServerSalt {
    pub bad_msg_id: i64,
    pub bad_msg_seqno: i32,
    pub error_code: i32,
    pub new_server_salt: i64,
}

impl Identifiable for BadServerSalt {
    const CONSTRUCTOR_ID: u32 = 0xedab447b;
}

impl Deserializable for BadServerSalt {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            bad_msg_id: i64::deserialize(buf)?,
            bad_msg_seqno: i32::deserialize(buf)?,
            error_code: i32::deserialize(buf)?,
            new_server_salt: i64::deserialize(buf)?,
        })
    }
}

/// `new_session_created#9ec20908`
#[derive(Clone, Debug, PartialEq)]
pub struct NewSessionCreated {
    pub first_msg_id: i64,
    pub unique_id: i64,
    pub server_salt: i64,
}

impl Identifiable for NewSessionCreated {
    const CONSTRUCTOR_ID: u32 = 0x9ec20908;
}

impl Deserializable for NewSessionCreated {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            first_msg_id: i64::deserialize(buf)?,
            unique_id: i64::deserialize(buf)?,
            server_salt: i64::deserialize(buf)?,
        })
    }
}

/// `msg_detailed_info#276d3ec6`
#[derive(Clone, Debug, PartialEq)]
pub struct MsgDetailedInfo {
    pub msg_id: i64,
    pub answer_msg_id: i64,
    pub bytes: i32,
    pub status: i32,
}

impl Identifiable for MsgDetailedInfo {
    const CONSTRUCTOR_ID: u32 = 0x276d3ec6;
}

impl Deserializable for MsgDetailedInfo {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            msg_id: i64::deserialize(buf)?,
            answer_msg_id: i64::deserialize(buf)?,
            bytes: i32::deserialize(buf)?,
            status: i32::deserialize(buf)?,
        })
    }
}

/// `msg_new_detailed_info#809db6df`
#[derive(Clone, Debug, PartialEq)]
pub struct MsgNewDetailedInfo {
    pub answer_msg_id: i64,
    pub bytes: i32,
    pub status: i32,
}

impl Identifiable for MsgNewDetailedInfo {
    const CONSTRUCTOR_ID: u32 = 0x809db6df;
}

impl Deserializable for MsgNewDetailedInfo {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            answer_msg_id: i64::deserialize(buf)?,
            bytes: i32::deserialize(buf)?,
            status: i32::deserialize(buf)?,
        })
    }
}

/// `rpc_error#2144ca19 error_code:int error_message:string = RpcError`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    pub error_code: i32,
    pub error_message: String,
}

impl Identifiable for RpcError {
    const CONSTRUCTOR_ID: u32 = 0x2144ca19;
}

impl Deserializable for RpcError {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            error_code: i32::deserialize(buf)?,
            error_message: String::deserialize(buf)?,
        })
    }
}

/// `rpc_result#f35c6d01 req_msg_id:long result:Object` — the result is left
/// raw; the caller owns its decoding.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcResult {
    pub req_msg_id: i64,
    pub result: Vec<u8>,
}

impl Identifiable for RpcResult {
    const CONSTRUCTOR_ID: u32 = 0xf35c6d01;
}

impl Deserializable for RpcResult {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            req_msg_id: i64::deserialize(buf)?,
            result: buf.read_to_end(),
        })
    }
}

/// `gzip_packed#3072cfa1 packed_data:bytes = Object`
#[derive(Clone, Debug, PartialEq)]
pub struct GzipPacked {
    pub packed_data: Vec<u8>,
}

impl Identifiable for GzipPacked {
    const CONSTRUCTOR_ID: u32 = 0x3072cfa1;
}

impl Deserializable for GzipPacked {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            packed_data: Vec::<u8>::deserialize(buf)?,
        })
    }
}

/// One element of a `msg_container`.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

/// `msg_container#73f1f8dc messages:vector<message> = MessageContainer`
///
/// Elements are bare `message` entries; nesting another container inside is
/// not permitted by the protocol.
#[derive(Clone, Debug, PartialEq)]
pub struct MsgContainer {
    pub messages: Vec<ContainerMessage>,
}

impl Identifiable for MsgContainer {
    const CONSTRUCTOR_ID: u32 = 0x73f1f8dc;
}

impl Deserializable for MsgContainer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_constructor(buf, Self::CONSTRUCTOR_ID)?;
        let count = i32::deserialize(buf)? as usize;
        let mut messages = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let msg_id = i64::deserialize(buf)?;
            let seq_no = i32::deserialize(buf)?;
            let len = i32::deserialize(buf)? as usize;
            let body = buf.read_vec(len)?;
            messages.push(ContainerMessage { msg_id, seq_no, body });
        }
        Ok(Self { messages })
    }
}
