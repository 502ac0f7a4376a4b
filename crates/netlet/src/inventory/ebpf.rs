//! Discovery of eBPF programs attached to an interface: classic tc
//! classifiers on the ingress/egress hooks, and TCX links. Everything here is
//! best-effort; an interface without hooks, an old kernel or missing
//! privileges simply yield empty results.

use std::io;
use std::os::fd::RawFd;

use tracing::trace;

use crate::nlraw::{self, RawConnection};

const NETLINK_ROUTE: isize = 0;
const RTM_GETTFILTER: u16 = 46;
const RTM_DELTFILTER: u16 = 45;

/// tc handle of the clsact/ingress pseudo parents.
const HANDLE_MIN_INGRESS: u32 = 0xffff_fff2;
const HANDLE_MIN_EGRESS: u32 = 0xffff_fff3;

const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const TCA_BPF_NAME: u16 = 7;

/// struct tcmsg: family, pad, ifindex, handle, parent, info.
fn tcmsg(ifindex: u32, parent: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.extend_from_slice(&[libc::AF_UNSPEC as u8, 0, 0, 0]);
    buf.extend_from_slice(&(ifindex as i32).to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&parent.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf
}

fn bpf_filter_names_for_parent(
    conn: &mut RawConnection,
    ifindex: u32,
    parent: u32,
) -> io::Result<Vec<String>> {
    let replies = conn.request(RTM_GETTFILTER, nlraw::NLM_F_DUMP, &tcmsg(ifindex, parent))?;
    let mut names = Vec::new();
    for payload in replies {
        if payload.len() < 20 {
            continue;
        }
        let mut kind = None;
        let mut name = None;
        for (attr, value) in nlraw::attrs(&payload[20..]) {
            match attr {
                TCA_KIND => kind = nlraw::attr_string(value),
                TCA_OPTIONS => {
                    for (opt, opt_value) in nlraw::attrs(value) {
                        if opt == TCA_BPF_NAME {
                            name = nlraw::attr_string(opt_value);
                        }
                    }
                }
                _ => {}
            }
        }
        if kind.as_deref() == Some("bpf") {
            if let Some(name) = name {
                names.push(name);
            }
        }
    }
    Ok(names)
}

/// Lists the names of the bpf classifiers attached to the legacy tc hooks of
/// the interface. `None` when there are none (or the dump failed).
pub fn tc_filter_names(ifindex: u32) -> Option<Vec<String>> {
    let mut conn = match RawConnection::open(NETLINK_ROUTE) {
        Ok(conn) => conn,
        Err(err) => {
            trace!(error = %err, "could not open tc netlink socket");
            return None;
        }
    };
    let mut names = Vec::new();
    for parent in [HANDLE_MIN_INGRESS, HANDLE_MIN_EGRESS] {
        match bpf_filter_names_for_parent(&mut conn, ifindex, parent) {
            Ok(found) => names.extend(found),
            Err(err) => trace!(ifindex, parent, error = %err, "tc filter dump failed"),
        }
    }
    names.sort();
    names.dedup();
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}

/// Removes every filter from the legacy tc hooks of the interface. Used when
/// a claim requests `disableEbpfPrograms`; must run inside the namespace the
/// interface currently lives in.
pub fn remove_tc_filters(ifindex: u32) -> io::Result<()> {
    let mut conn = RawConnection::open(NETLINK_ROUTE)?;
    for parent in [HANDLE_MIN_INGRESS, HANDLE_MIN_EGRESS] {
        match conn.request(RTM_DELTFILTER, nlraw::NLM_F_ACK, &tcmsg(ifindex, parent)) {
            Ok(_) => {}
            // No qdisc or no filters on this hook.
            Err(err) if matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EINVAL)) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

// bpf(2) plumbing for TCX link enumeration. TCX attachments are bpf links,
// not tc filters, so they are found by walking the link id space and asking
// for each link's info.

const BPF_PROG_GET_FD_BY_ID: libc::c_int = 13;
const BPF_OBJ_GET_INFO_BY_FD: libc::c_int = 15;
const BPF_LINK_GET_FD_BY_ID: libc::c_int = 30;
const BPF_LINK_GET_NEXT_ID: libc::c_int = 31;

const BPF_LINK_TYPE_TCX: u32 = 11;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct BpfGetIdAttr {
    start_id: u32,
    next_id: u32,
    open_flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct BpfObjGetInfoAttr {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

/// Prefix of struct bpf_link_info followed by the tcx member of its union.
#[repr(C)]
#[derive(Clone, Copy)]
struct BpfLinkInfo {
    link_type: u32,
    id: u32,
    prog_id: u32,
    _pad: u32,
    ifindex: u32,
    attach_type: u32,
    _reserved: [u8; 40],
}

/// Prefix of struct bpf_prog_info up to and including the name field.
#[repr(C)]
#[derive(Clone, Copy)]
struct BpfProgInfo {
    prog_type: u32,
    id: u32,
    tag: [u8; 8],
    jited_prog_len: u32,
    xlated_prog_len: u32,
    jited_prog_insns: u64,
    xlated_prog_insns: u64,
    load_time: u64,
    created_by_uid: u32,
    nr_map_ids: u32,
    map_ids: u64,
    name: [u8; 16],
    _reserved: [u8; 64],
}

fn bpf<T>(cmd: libc::c_int, attr: &mut T) -> io::Result<RawFd> {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut T as *mut libc::c_void,
            std::mem::size_of::<T>(),
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as RawFd)
    }
}

fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

fn link_info(fd: RawFd) -> io::Result<BpfLinkInfo> {
    let mut info = unsafe { std::mem::zeroed::<BpfLinkInfo>() };
    let mut attr = BpfObjGetInfoAttr {
        bpf_fd: fd as u32,
        info_len: std::mem::size_of::<BpfLinkInfo>() as u32,
        info: &mut info as *mut BpfLinkInfo as u64,
    };
    bpf(BPF_OBJ_GET_INFO_BY_FD, &mut attr)?;
    Ok(info)
}

fn program_name(prog_id: u32) -> io::Result<String> {
    let mut attr = BpfGetIdAttr {
        start_id: prog_id,
        ..Default::default()
    };
    let fd = bpf(BPF_PROG_GET_FD_BY_ID, &mut attr)?;
    let mut info = unsafe { std::mem::zeroed::<BpfProgInfo>() };
    let mut get_info = BpfObjGetInfoAttr {
        bpf_fd: fd as u32,
        info_len: std::mem::size_of::<BpfProgInfo>() as u32,
        info: &mut info as *mut BpfProgInfo as u64,
    };
    let result = bpf(BPF_OBJ_GET_INFO_BY_FD, &mut get_info);
    close(fd);
    result?;
    let end = info.name.iter().position(|b| *b == 0).unwrap_or(info.name.len());
    Ok(String::from_utf8_lossy(&info.name[..end]).to_string())
}

/// Lists the names of the bpf programs attached to the interface through TCX
/// links. `None` when there are none or the kernel predates TCX.
pub fn tcx_program_names(ifindex: u32) -> Option<Vec<String>> {
    let mut names = Vec::new();
    let mut current = 0u32;
    loop {
        let mut attr = BpfGetIdAttr {
            start_id: current,
            ..Default::default()
        };
        match bpf(BPF_LINK_GET_NEXT_ID, &mut attr) {
            Ok(_) => current = attr.next_id,
            // ENOENT ends the walk; anything else (EPERM, old kernel) aborts it.
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => break,
            Err(err) => {
                trace!(error = %err, "bpf link walk failed");
                return None;
            }
        }

        let mut fd_attr = BpfGetIdAttr {
            start_id: current,
            ..Default::default()
        };
        let fd = match bpf(BPF_LINK_GET_FD_BY_ID, &mut fd_attr) {
            Ok(fd) => fd,
            Err(_) => continue,
        };
        let info = link_info(fd);
        close(fd);
        let info = match info {
            Ok(info) => info,
            Err(_) => continue,
        };
        if info.link_type != BPF_LINK_TYPE_TCX || info.ifindex != ifindex {
            continue;
        }
        if let Ok(name) = program_name(info.prog_id) {
            if !name.is_empty() {
                names.push(name);
            }
        }
    }
    names.sort();
    names.dedup();
    if names.is_empty() {
        None
    } else {
        Some(names)
    }
}
