//! The process-wide data-center address table.
//!
//! Seeded with the built-in defaults and replaced wholesale whenever a
//! connector parses a fresh `help.getConfig` reply. Readers get copies.

use std::collections::HashMap;
use std::sync::{LazyLock, RwLock};

use courier_tl::api::DcOption;

/// Initial DC when no session exists.
pub const DEFAULT_DC: i32 = 4;
/// Initial DC in test mode.
pub const DEFAULT_TEST_DC: i32 = 2;

#[derive(Clone, Debug, Default)]
struct DcAddrs {
    v4: Option<String>,
    v6: Option<String>,
}

static PRODUCTION: LazyLock<RwLock<HashMap<i32, DcAddrs>>> =
    LazyLock::new(|| RwLock::new(production_defaults()));

static TEST: LazyLock<RwLock<HashMap<i32, DcAddrs>>> =
    LazyLock::new(|| RwLock::new(test_defaults()));

fn production_defaults() -> HashMap<i32, DcAddrs> {
    [
        (1, "149.154.175.58:443", "[2001:b28:f23d:f001::a]:443"),
        (2, "149.154.167.50:443", "[2001:67c:4e8:f002::a]:443"),
        (3, "149.154.175.100:443", "[2001:b28:f23d:f003::a]:443"),
        (4, "149.154.167.91:443", "[2001:67c:4e8:f004::a]:443"),
        (5, "91.108.56.151:443", "[2001:b28:f23f:f005::a]:443"),
    ]
    .into_iter()
    .map(|(id, v4, v6)| {
        (
            id,
            DcAddrs {
                v4: Some(v4.to_string()),
                v6: Some(v6.to_string()),
            },
        )
    })
    .collect()
}

fn test_defaults() -> HashMap<i32, DcAddrs> {
    [
        (1, "149.154.175.10:443"),
        (2, "149.154.167.40:443"),
        (3, "149.154.175.117:443"),
    ]
    .into_iter()
    .map(|(id, v4)| {
        (
            id,
            DcAddrs {
                v4: Some(v4.to_string()),
                v6: None,
            },
        )
    })
    .collect()
}

fn table(test_mode: bool) -> &'static RwLock<HashMap<i32, DcAddrs>> {
    if test_mode {
        &TEST
    } else {
        &PRODUCTION
    }
}

/// The `host:port` for a DC, honoring the address-family preference.
/// Falls back to the other family when the preferred one is missing.
pub fn addr_for(dc_id: i32, test_mode: bool, ipv6: bool) -> Option<String> {
    let guard = table(test_mode).read().unwrap();
    let addrs = guard.get(&dc_id)?;
    if ipv6 {
        addrs.v6.clone().or_else(|| addrs.v4.clone())
    } else {
        addrs.v4.clone().or_else(|| addrs.v6.clone())
    }
}

/// Reverse lookup: which DC does this address belong to?
pub fn dc_for_addr(addr: &str, test_mode: bool) -> Option<i32> {
    let guard = table(test_mode).read().unwrap();
    guard
        .iter()
        .find(|(_, addrs)| {
            addrs.v4.as_deref() == Some(addr) || addrs.v6.as_deref() == Some(addr)
        })
        .map(|(&id, _)| id)
}

/// Fold a `help.getConfig` DC option list into a fresh table and replace the
/// current one. Media-only, CDN, and TCPO-only entries are skipped, as are
/// entries carrying a proxy secret.
pub fn update_from_config(options: &[DcOption], test_mode: bool) {
    let mut fresh = if test_mode {
        test_defaults()
    } else {
        production_defaults()
    };

    for opt in options {
        if opt.media_only || opt.cdn || opt.tcpo_only || opt.secret.is_some() {
            continue;
        }
        let entry = fresh.entry(opt.id).or_default();
        if opt.ipv6 {
            entry.v6 = Some(format!("[{}]:{}", opt.ip_address, opt.port));
        } else {
            entry.v4 = Some(format!("{}:{}", opt.ip_address, opt.port));
        }
    }

    *table(test_mode).write().unwrap() = fresh;
}
