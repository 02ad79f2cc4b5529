/*
 * I/O wrapper behaviour over real descriptors: pipes, TCP echo over
 * loopback, UDP datagrams, user-nonblocking pass-through, and error
 * mapping.
 */

mod common;

use std::io::ErrorKind;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::run_fibre;
use libc::{c_int, sockaddr, socklen_t};
use strand::io;
use strand::Fibre;

fn loopback(port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_be_bytes([127, 0, 0, 1]).to_be(),
        },
        sin_zero: [0; 8],
    }
}

fn local_port(fd: c_int) -> u16 {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
    let ret = unsafe {
        libc::getsockname(fd, &mut addr as *mut _ as *mut sockaddr, &mut len)
    };
    assert_eq!(ret, 0);
    u16::from_be(addr.sin_port)
}

fn addr_len() -> socklen_t {
    mem::size_of::<libc::sockaddr_in>() as socklen_t
}

#[test]
fn pipe_read_parks_until_write() {
    let got = run_fibre(|| {
        let (r, w) = io::pipe().unwrap();
        let writer = Fibre::spawn(move || {
            strand::sleep(Duration::from_millis(20));
            assert_eq!(io::write(w, b"ping").unwrap(), 4);
        });
        let mut buf = [0u8; 16];
        let n = io::read(r, &mut buf).unwrap();
        writer.join();
        io::close(r).unwrap();
        io::close(w).unwrap();
        buf[..n].to_vec()
    });
    assert_eq!(got, b"ping");
}

#[test]
fn echo_server_smoke() {
    const CLIENTS: usize = 64;
    const PAYLOAD: usize = 64;

    let (accepts, mismatches) = run_fibre(|| {
        let lfd = io::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let one: c_int = 1;
        unsafe {
            libc::setsockopt(
                lfd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const c_int as *const libc::c_void,
                mem::size_of::<c_int>() as socklen_t,
            );
        }
        let addr = loopback(0);
        unsafe { io::bind(lfd, &addr as *const _ as *const sockaddr, addr_len()) }.unwrap();
        io::listen(lfd, 128).unwrap();
        let port = local_port(lfd);

        let accepts = Arc::new(AtomicUsize::new(0));
        let server = {
            let accepts = Arc::clone(&accepts);
            Fibre::spawn(move || {
                for _ in 0..CLIENTS {
                    let cfd =
                        unsafe { io::accept(lfd, ptr::null_mut(), ptr::null_mut()) }.unwrap();
                    accepts.fetch_add(1, Ordering::Relaxed);
                    Fibre::spawn(move || {
                        let mut buf = [0u8; PAYLOAD];
                        let mut got = 0;
                        while got < PAYLOAD {
                            match io::read(cfd, &mut buf[got..]).unwrap() {
                                0 => break,
                                n => got += n,
                            }
                        }
                        let mut sent = 0;
                        while sent < got {
                            sent += io::write(cfd, &buf[sent..got]).unwrap();
                        }
                        io::close(cfd).unwrap();
                    })
                    .detach();
                }
            })
        };

        let mismatches = Arc::new(AtomicUsize::new(0));
        let clients: Vec<Fibre> = (0..CLIENTS)
            .map(|i| {
                let mismatches = Arc::clone(&mismatches);
                Fibre::spawn(move || {
                    let fd = io::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
                    let addr = loopback(port);
                    unsafe { io::connect(fd, &addr as *const _ as *const sockaddr, addr_len()) }
                        .unwrap();
                    let msg = [i as u8; PAYLOAD];
                    let mut sent = 0;
                    while sent < PAYLOAD {
                        sent += io::write(fd, &msg[sent..]).unwrap();
                    }
                    let mut back = [0u8; PAYLOAD];
                    let mut got = 0;
                    while got < PAYLOAD {
                        match io::read(fd, &mut back[got..]).unwrap() {
                            0 => break,
                            n => got += n,
                        }
                    }
                    if back != msg {
                        mismatches.fetch_add(1, Ordering::Relaxed);
                    }
                    io::close(fd).unwrap();
                })
            })
            .collect();

        for c in clients {
            c.join();
        }
        server.join();
        io::close(lfd).unwrap();
        (
            accepts.load(Ordering::Relaxed),
            mismatches.load(Ordering::Relaxed),
        )
    });
    assert_eq!(accepts, CLIENTS);
    assert_eq!(mismatches, 0);
}

#[test]
fn try_accept_reports_would_block() {
    let kind = run_fibre(|| {
        let lfd = io::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let addr = loopback(0);
        unsafe { io::bind(lfd, &addr as *const _ as *const sockaddr, addr_len()) }.unwrap();
        io::listen(lfd, 8).unwrap();
        let err = unsafe { io::try_accept(lfd, ptr::null_mut(), ptr::null_mut()) }.unwrap_err();
        io::close(lfd).unwrap();
        err.kind()
    });
    assert_eq!(kind, ErrorKind::WouldBlock);
}

#[test]
fn user_nonblocking_passes_eagain_through() {
    let kind = run_fibre(|| {
        let (r, w) = io::pipe().unwrap();
        io::fcntl_setfl(r, libc::O_NONBLOCK).unwrap();
        let mut buf = [0u8; 8];
        let err = io::read(r, &mut buf).unwrap_err();
        io::close(r).unwrap();
        io::close(w).unwrap();
        err.kind()
    });
    assert_eq!(kind, ErrorKind::WouldBlock);
}

#[test]
fn wrapper_rejects_unknown_descriptor() {
    let err = run_fibre(|| {
        let mut buf = [0u8; 4];
        io::read(1_000_000, &mut buf).unwrap_err()
    });
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));
}

#[test]
fn dup_clones_are_usable() {
    let got = run_fibre(|| {
        let (r, w) = io::pipe().unwrap();
        let w2 = io::dup(w).unwrap();
        let writer = Fibre::spawn(move || {
            strand::sleep(Duration::from_millis(10));
            io::write(w2, b"dup").unwrap();
            io::close(w2).unwrap();
        });
        let mut buf = [0u8; 8];
        let n = io::read(r, &mut buf).unwrap();
        writer.join();
        io::close(r).unwrap();
        io::close(w).unwrap();
        buf[..n].to_vec()
    });
    assert_eq!(got, b"dup");
}

#[test]
fn udp_datagram_roundtrip() {
    let got = run_fibre(|| {
        let a = io::socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        let b = io::socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        let bind_addr = loopback(0);
        unsafe { io::bind(b, &bind_addr as *const _ as *const sockaddr, addr_len()) }.unwrap();
        let dest = loopback(local_port(b));

        let sender = Fibre::spawn(move || {
            strand::sleep(Duration::from_millis(10));
            let n = unsafe {
                io::send_to(
                    a,
                    b"datagram",
                    0,
                    &dest as *const _ as *const sockaddr,
                    addr_len(),
                )
            }
            .unwrap();
            assert_eq!(n, 8);
            io::close(a).unwrap();
        });

        let mut buf = [0u8; 32];
        let mut from: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut from_len = addr_len();
        let n = unsafe {
            io::recv_from(
                b,
                &mut buf,
                0,
                &mut from as *mut _ as *mut sockaddr,
                &mut from_len,
            )
        }
        .unwrap();
        sender.join();
        io::close(b).unwrap();
        buf[..n].to_vec()
    });
    assert_eq!(got, b"datagram");
}
