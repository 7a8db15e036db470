//! The minimal API-layer subset the transport core itself needs: connection
//! initialization, server configuration, and cross-DC authorization
//! export/import. Higher-level API surfaces live outside this crate.

use crate::deserialize::{Buffer, Error, Result};
use crate::{Blob, Deserializable, Identifiable, RemoteCall, Serializable};

/// `invokeWithLayer#da9b0d0d {X:Type} layer:int query:!X = X`
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeWithLayer<Q> {
    pub layer: i32,
    pub query: Q,
}

impl<Q> Identifiable for InvokeWithLayer<Q> {
    const CONSTRUCTOR_ID: u32 = 0xda9b0d0d;
}

impl<Q: Serializable> Serializable for InvokeWithLayer<Q> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.layer.serialize(buf);
        self.query.serialize(buf);
    }
}

impl<Q: RemoteCall> RemoteCall for InvokeWithLayer<Q> {
    type Return = Q::Return;
}

/// `initConnection#c1cd5ea9 {X:Type} flags:# api_id:int device_model:string
/// system_version:string app_version:string system_lang_code:string
/// lang_pack:string lang_code:string proxy:flags.0?InputClientProxy
/// params:flags.1?JSONValue query:!X = X`
///
/// The optional proxy/params fields are never sent by this client, so the
/// flags word is always zero.
#[derive(Clone, Debug, PartialEq)]
pub struct InitConnection<Q> {
    pub api_id: i32,
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub system_lang_code: String,
    pub lang_pack: String,
    pub lang_code: String,
    pub query: Q,
}

impl<Q> Identifiable for InitConnection<Q> {
    const CONSTRUCTOR_ID: u32 = 0xc1cd5ea9;
}

impl<Q: Serializable> Serializable for InitConnection<Q> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        0u32.serialize(buf); // flags
        self.api_id.serialize(buf);
        self.device_model.serialize(buf);
        self.system_version.serialize(buf);
        self.app_version.serialize(buf);
        self.system_lang_code.serialize(buf);
        self.lang_pack.serialize(buf);
        self.lang_code.serialize(buf);
        self.query.serialize(buf);
    }
}

impl<Q: RemoteCall> RemoteCall for InitConnection<Q> {
    type Return = Q::Return;
}

/// `help.getConfig#c4f9186b = Config`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GetConfig {}

impl Identifiable for GetConfig {
    const CONSTRUCTOR_ID: u32 = 0xc4f9186b;
}

impl Serializable for GetConfig {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
    }
}

impl RemoteCall for GetConfig {
    type Return = Config;
}

/// `dcOption#18b7a10d` — one address of one data center.
#[derive(Clone, Debug, PartialEq)]
pub struct DcOption {
    pub ipv6: bool,
    pub media_only: bool,
    pub tcpo_only: bool,
    pub cdn: bool,
    pub static_only: bool,
    pub this_port_only: bool,
    pub id: i32,
    pub ip_address: String,
    pub port: i32,
    pub secret: Option<Vec<u8>>,
}

impl Identifiable for DcOption {
    const CONSTRUCTOR_ID: u32 = 0x18b7a10d;
}

impl Deserializable for DcOption {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != Self::CONSTRUCTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        let flags = u32::deserialize(buf)?;
        Ok(Self {
            ipv6: flags & (1 << 0) != 0,
            media_only: flags & (1 << 1) != 0,
            tcpo_only: flags & (1 << 2) != 0,
            cdn: flags & (1 << 3) != 0,
            static_only: flags & (1 << 4) != 0,
            this_port_only: flags & (1 << 5) != 0,
            id: i32::deserialize(buf)?,
            ip_address: String::deserialize(buf)?,
            port: i32::deserialize(buf)?,
            secret: if flags & (1 << 10) != 0 {
                Some(Vec::<u8>::deserialize(buf)?)
            } else {
                None
            },
        })
    }
}

/// `config#cc1a241e` — decoded only as far as the transport core needs;
/// the long tail of client-tuning fields after `dc_options` is ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub date: i32,
    pub expires: i32,
    pub test_mode: bool,
    pub this_dc: i32,
    pub dc_options: Vec<DcOption>,
}

impl Identifiable for Config {
    const CONSTRUCTOR_ID: u32 = 0xcc1a241e;
}

impl Deserializable for Config {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != Self::CONSTRUCTOR_ID {
            return Err(Error::UnexpectedConstructor { id });
        }
        let _flags = u32::deserialize(buf)?;
        Ok(Self {
            date: i32::deserialize(buf)?,
            expires: i32::deserialize(buf)?,
            test_mode: bool::deserialize(buf)?,
            this_dc: i32::deserialize(buf)?,
            dc_options: Vec::<DcOption>::deserialize(buf)?,
        })
    }
}

pub mod auth {
    //! `auth.*` functions for moving an authorization between data centers.

    use super::*;

    /// `auth.exportAuthorization#e5bfffcd dc_id:int = auth.ExportedAuthorization`
    #[derive(Clone, Debug, PartialEq)]
    pub struct ExportAuthorization {
        pub dc_id: i32,
    }

    impl Identifiable for ExportAuthorization {
        const CONSTRUCTOR_ID: u32 = 0xe5bfffcd;
    }

    impl Serializable for ExportAuthorization {
        fn serialize(&self, buf: &mut impl Extend<u8>) {
            Self::CONSTRUCTOR_ID.serialize(buf);
            self.dc_id.serialize(buf);
        }
    }

    impl RemoteCall for ExportAuthorization {
        type Return = ExportedAuthorization;
    }

    /// `auth.exportedAuthorization#b434e2b8 id:long bytes:bytes`
    #[derive(Clone, Debug, PartialEq)]
    pub struct ExportedAuthorization {
        pub id: i64,
        pub bytes: Vec<u8>,
    }

    impl Identifiable for ExportedAuthorization {
        const CONSTRUCTOR_ID: u32 = 0xb434e2b8;
    }

    impl Deserializable for ExportedAuthorization {
        fn deserialize(buf: Buffer) -> Result<Self> {
            let id = u32::deserialize(buf)?;
            if id != Self::CONSTRUCTOR_ID {
                return Err(Error::UnexpectedConstructor { id });
            }
            Ok(Self {
                id: i64::deserialize(buf)?,
                bytes: Vec::<u8>::deserialize(buf)?,
            })
        }
    }

    /// `auth.importAuthorization#a57a7dad id:long bytes:bytes = auth.Authorization`
    ///
    /// The returned `auth.Authorization` belongs to the API layer above this
    /// crate, so it is surfaced as an opaque [`Blob`].
    #[derive(Clone, Debug, PartialEq)]
    pub struct ImportAuthorization {
        pub id: i64,
        pub bytes: Vec<u8>,
    }

    impl Identifiable for ImportAuthorization {
        const CONSTRUCTOR_ID: u32 = 0xa57a7dad;
    }

    impl Serializable for ImportAuthorization {
        fn serialize(&self, buf: &mut impl Extend<u8>) {
            Self::CONSTRUCTOR_ID.serialize(buf);
            self.id.serialize(buf);
            self.bytes.serialize(buf);
        }
    }

    impl RemoteCall for ImportAuthorization {
        type Return = Blob;
    }
}
