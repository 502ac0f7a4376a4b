//! Ethtool feature toggles through the classic `SIOCETHTOOL` ioctl. The
//! feature names are resolved against the device's string set, then the
//! requested bits are flipped with an `ETHTOOL_SFEATURES` call. Must run in
//! the network namespace the interface currently lives in.

use std::collections::HashMap;
use std::os::fd::AsRawFd;

use anyhow::{anyhow, Context, Result};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};

const ETHTOOL_GSSET_INFO: u32 = 0x37;
const ETHTOOL_GSTRINGS: u32 = 0x1b;
const ETHTOOL_SFEATURES: u32 = 0x3b;

const ETH_SS_FEATURES: u32 = 4;
const ETH_GSTRING_LEN: usize = 32;

nix::ioctl_write_ptr_bad!(ioctl_ethtool, libc::SIOCETHTOOL, libc::ifreq);

fn ifreq_for(ifname: &str, data: *mut libc::c_void) -> Result<libc::ifreq> {
    if ifname.len() >= libc::IFNAMSIZ {
        return Err(anyhow!("interface name {ifname} too long"));
    }
    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    for (i, byte) in ifname.as_bytes().iter().enumerate() {
        request.ifr_name[i] = *byte as libc::c_char;
    }
    request.ifr_ifru.ifru_data = data as *mut libc::c_char;
    Ok(request)
}

fn ethtool_call(fd: i32, ifname: &str, data: *mut libc::c_void) -> Result<()> {
    let mut request = ifreq_for(ifname, data)?;
    unsafe { ioctl_ethtool(fd, &mut request) }
        .with_context(|| format!("ethtool ioctl failed for {ifname}"))?;
    Ok(())
}

/// Number of entries in the device's feature string set.
fn feature_count(fd: i32, ifname: &str) -> Result<u32> {
    // struct ethtool_sset_info { u32 cmd; u32 reserved; u64 sset_mask; u32 data[]; }
    #[repr(C)]
    struct SsetInfo {
        cmd: u32,
        reserved: u32,
        sset_mask: u64,
        data: u32,
    }
    let mut info = SsetInfo {
        cmd: ETHTOOL_GSSET_INFO,
        reserved: 0,
        sset_mask: 1u64 << ETH_SS_FEATURES,
        data: 0,
    };
    ethtool_call(fd, ifname, &mut info as *mut SsetInfo as *mut libc::c_void)?;
    if info.sset_mask & (1u64 << ETH_SS_FEATURES) == 0 {
        return Err(anyhow!("device {ifname} has no feature string set"));
    }
    Ok(info.data)
}

/// Maps feature name to bit index for the device.
fn feature_bits(fd: i32, ifname: &str) -> Result<HashMap<String, usize>> {
    let count = feature_count(fd, ifname)? as usize;
    // struct ethtool_gstrings { u32 cmd; u32 string_set; u32 len; u8 data[]; }
    let mut buffer = vec![0u8; 12 + count * ETH_GSTRING_LEN];
    buffer[0..4].copy_from_slice(&ETHTOOL_GSTRINGS.to_ne_bytes());
    buffer[4..8].copy_from_slice(&ETH_SS_FEATURES.to_ne_bytes());
    buffer[8..12].copy_from_slice(&(count as u32).to_ne_bytes());
    ethtool_call(fd, ifname, buffer.as_mut_ptr() as *mut libc::c_void)?;

    let mut bits = HashMap::new();
    for index in 0..count {
        let start = 12 + index * ETH_GSTRING_LEN;
        let raw = &buffer[start..start + ETH_GSTRING_LEN];
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        let name = String::from_utf8_lossy(&raw[..end]).to_string();
        if !name.is_empty() {
            bits.insert(name, index);
        }
    }
    Ok(bits)
}

/// The `ETHTOOL_SFEATURES` payload: per-32-bit block, which bits are valid
/// (being changed) and what they are requested to be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureBlock {
    pub valid: u32,
    pub requested: u32,
}

/// Computes the set-features blocks from the resolved bit indexes and the
/// desired states. Unknown feature names are reported back, they do not
/// abort the call.
pub fn compute_feature_blocks(
    bits: &HashMap<String, usize>,
    wanted: &HashMap<String, bool>,
) -> (Vec<FeatureBlock>, Vec<String>) {
    let block_count = bits.values().map(|bit| bit / 32 + 1).max().unwrap_or(0);
    let mut blocks = vec![FeatureBlock::default(); block_count];
    let mut unknown = Vec::new();
    for (name, enable) in wanted {
        match bits.get(name) {
            None => unknown.push(name.clone()),
            Some(bit) => {
                let block = &mut blocks[bit / 32];
                let mask = 1u32 << (bit % 32);
                block.valid |= mask;
                if *enable {
                    block.requested |= mask;
                }
            }
        }
    }
    unknown.sort();
    (blocks, unknown)
}

/// Applies the requested feature states to the interface.
pub fn set_features(ifname: &str, wanted: &HashMap<String, bool>) -> Result<()> {
    if wanted.is_empty() {
        return Ok(());
    }
    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .context("could not open ethtool socket")?;
    let fd = sock.as_raw_fd();

    let bits = feature_bits(fd, ifname)?;
    let (blocks, unknown) = compute_feature_blocks(&bits, wanted);
    if !unknown.is_empty() {
        return Err(anyhow!(
            "unknown ethtool features on {ifname}: {}",
            unknown.join(", ")
        ));
    }

    // struct ethtool_sfeatures { u32 cmd; u32 size; struct { u32 valid; u32 requested; } features[]; }
    let mut buffer = vec![0u8; 8 + blocks.len() * 8];
    buffer[0..4].copy_from_slice(&ETHTOOL_SFEATURES.to_ne_bytes());
    buffer[4..8].copy_from_slice(&(blocks.len() as u32).to_ne_bytes());
    for (i, block) in blocks.iter().enumerate() {
        let start = 8 + i * 8;
        buffer[start..start + 4].copy_from_slice(&block.valid.to_ne_bytes());
        buffer[start + 4..start + 8].copy_from_slice(&block.requested.to_ne_bytes());
    }
    ethtool_call(fd, ifname, buffer.as_mut_ptr() as *mut libc::c_void)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bits() -> HashMap<String, usize> {
        HashMap::from([
            ("rx-checksum".to_string(), 2),
            ("rx-gro".to_string(), 33),
            ("tx-tcp-segmentation".to_string(), 35),
        ])
    }

    #[test]
    fn blocks_span_the_highest_bit() {
        let wanted = HashMap::from([("rx-gro".to_string(), false), ("rx-checksum".to_string(), true)]);
        let (blocks, unknown) = compute_feature_blocks(&bits(), &wanted);
        assert!(unknown.is_empty());
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].valid, 1 << 2);
        assert_eq!(blocks[0].requested, 1 << 2);
        // rx-gro is bit 1 of the second block and is being cleared.
        assert_eq!(blocks[1].valid, 1 << 1);
        assert_eq!(blocks[1].requested, 0);
    }

    #[test]
    fn unknown_features_are_reported() {
        let wanted = HashMap::from([("no-such-feature".to_string(), true)]);
        let (blocks, unknown) = compute_feature_blocks(&bits(), &wanted);
        assert!(blocks.iter().all(|b| b.valid == 0));
        assert_eq!(unknown, vec!["no-such-feature"]);
    }

    #[test]
    fn empty_request_is_a_noop() {
        assert!(set_features("lo", &HashMap::new()).is_ok());
    }
}
