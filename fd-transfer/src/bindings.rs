use std::io;
use std::mem::size_of;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

/// The maximum number of descriptors the kernel accepts in a single `SCM_RIGHTS` control message
/// (`SCM_MAX_FD`).
pub const MAX_FDS: usize = 253;

/// Result of [`recv_with_fds`].
#[derive(Debug)]
pub struct Message {
    /// Number of bytes read into the buffer, `0` on end of stream.
    pub len: usize,
    /// Descriptors carried by the message, in the order the sender attached them.
    pub fds: Vec<OwnedFd>,
    /// The kernel discarded some control data (`MSG_CTRUNC`).
    pub truncated: bool,
}

/// Bytes of ancillary data occupied by `count` descriptors, excluding the header.
fn payload_len(count: usize) -> u32 {
    // `count <= MAX_FDS` thus this always fits.
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let len = (count * size_of::<libc::c_int>()) as u32;
    len
}

/// A zeroed, `cmsghdr` aligned, buffer large enough for `count` descriptors.
fn control_buffer(count: usize) -> Vec<u64> {
    // SAFETY:
    // `CMSG_SPACE` is pure arithmetic.
    #[allow(clippy::as_conversions)]
    let space = unsafe { libc::CMSG_SPACE(payload_len(count)) } as usize;
    vec![0; (space + size_of::<u64>() - 1) / size_of::<u64>()]
}

/// Sends `data` over the stream socket `socket` with `fds` attached as a single `SCM_RIGHTS`
/// control message, returning the number of bytes of `data` written.
///
/// The descriptors remain open in this process, the receiver gets new descriptors referring to
/// the same open file descriptions. `data` must not be empty when `fds` is not, stream sockets
/// only deliver ancillary data alongside at least one byte.
///
/// <https://man7.org/linux/man-pages/man2/sendmsg.2.html>
pub fn send_with_fds(socket: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    if fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} descriptors exceed the limit of {MAX_FDS}", fds.len()),
        ));
    }
    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut control = control_buffer(fds.len());

    // SAFETY:
    // An all zero `msghdr` is a valid empty message.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    if !fds.is_empty() {
        msg.msg_control = control.as_mut_ptr().cast();
        msg.msg_controllen = (control.len() * size_of::<u64>()) as _;
        // SAFETY:
        // `control` is aligned and sized by `CMSG_SPACE` for exactly `fds.len()` descriptors, so
        // the first header and its data are in bounds.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload_len(fds.len())) as _;
            let data_ptr = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
            for (i, fd) in fds.iter().enumerate() {
                std::ptr::write_unaligned(data_ptr.add(i), *fd);
            }
        }
    }

    loop {
        // SAFETY:
        // `msg` only points at `iov`, `data` and `control`, all of which outlive this call.
        let sent = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL) };
        match usize::try_from(sent) {
            Ok(sent) => return Ok(sent),
            Err(_) => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    }
}

/// Receives into `buf` from the stream socket `socket`, collecting any `SCM_RIGHTS` descriptors
/// attached to the bytes read.
///
/// Received descriptors are created close-on-exec and are owned by the returned [`Message`], so
/// they are closed on every path where the caller does not take them.
///
/// <https://man7.org/linux/man-pages/man2/recvmsg.2.html>
pub fn recv_with_fds(socket: RawFd, buf: &mut [u8]) -> io::Result<Message> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let mut control = control_buffer(MAX_FDS);

    // SAFETY:
    // An all zero `msghdr` is a valid empty message.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = (control.len() * size_of::<u64>()) as _;

    let len = loop {
        // SAFETY:
        // `msg` only points at `iov`, `buf` and `control`, all of which outlive this call.
        let received = unsafe { libc::recvmsg(socket, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        match usize::try_from(received) {
            Ok(len) => break len,
            Err(_) => {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err);
                }
            }
        }
    };

    let mut fds = Vec::new();
    // SAFETY:
    // The kernel filled `control` with well formed control messages, `msg_controllen` was updated
    // to their total length, so iterating with the `CMSG_*` macros stays in bounds.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
                #[allow(clippy::as_conversions)]
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / size_of::<libc::c_int>();
                for i in 0..count {
                    fds.push(OwnedFd::from_raw_fd(std::ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Message {
        len,
        fds,
        truncated: msg.msg_flags & libc::MSG_CTRUNC != 0,
    })
}
