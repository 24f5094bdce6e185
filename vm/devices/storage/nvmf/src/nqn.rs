// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! NVMe Qualified Name helpers.

use crate::spec::fabrics::NQN_FIELD_SIZE;
use crate::spec::fabrics::NQN_MAX_LEN;

/// Performs the syntactic checks applied to NQNs in a CONNECT.
pub fn nqn_valid(nqn: &str) -> bool {
    !nqn.is_empty() && nqn.len() <= NQN_MAX_LEN && nqn.starts_with("nqn.")
}

/// Extracts an NQN from a NUL padded field. Returns `None` if the field is
/// not NUL terminated or not UTF-8.
pub(crate) fn nqn_from_field(field: &[u8; NQN_FIELD_SIZE]) -> Option<&str> {
    let len = field.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&field[..len]).ok()
}

pub(crate) fn nqn_to_field(nqn: &str) -> [u8; NQN_FIELD_SIZE] {
    let mut field = [0; NQN_FIELD_SIZE];
    let len = nqn.len().min(NQN_FIELD_SIZE - 1);
    field[..len].copy_from_slice(&nqn.as_bytes()[..len]);
    field
}

/// Builds the UUID based host NQN for `hostid`.
pub fn host_nqn_from_uuid(hostid: &[u8; 16]) -> String {
    let mut nqn = String::from("nqn.2014-08.org.nvmexpress:uuid:");
    for (i, b) in hostid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            nqn.push('-');
        }
        nqn.push_str(&format!("{b:02x}"));
    }
    nqn
}
