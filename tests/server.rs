//! Wire-level integration tests for the server, driven over an in-memory
//! duplex stream built from a pair of pipes.

use std::io::prelude::*;
use std::sync::Arc;
use std::thread;

use byteorder::{ReadBytesExt, WriteBytesExt, BE};
use pipe::{PipeReader, PipeWriter};
use readwrite::ReadWrite;

use nbdserve::{client::Client, Export, MemBlocks, Registry, Server};

// option ids
const OPT_ABORT: u32 = 2;
const OPT_LIST: u32 = 3;
const OPT_GO: u32 = 7;
const OPT_STRUCTURED_REPLY: u32 = 8;

// option reply types
const REP_ACK: u32 = 1;
const REP_SERVER: u32 = 2;
const REP_INFO: u32 = 3;
const REP_ERR_UNSUP: u32 = (1 << 31) + 1;
const REP_ERR_INVALID: u32 = (1 << 31) + 3;
const REP_ERR_UNKNOWN: u32 = (1 << 31) + 6;

const CMD_READ: u16 = 0;
const CMD_WRITE: u16 = 1;
const CMD_DISCONNECT: u16 = 2;

const IHAVEOPT: u64 = 0x49484156454F5054;
const OPTION_REPLY_MAGIC: u64 = 0x3e889045565a9;
const REQUEST_MAGIC: u32 = 0x25609513;
const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

/// The first 18 bytes of every connection: NBDMAGIC, IHAVEOPT, and the
/// FIXED_NEWSTYLE | NO_ZEROES handshake flags.
const GREETING: [u8; 18] = [
    0x4e, 0x42, 0x44, 0x4d, 0x41, 0x47, 0x49, 0x43, // "NBDMAGIC"
    0x49, 0x48, 0x41, 0x56, 0x45, 0x4f, 0x50, 0x54, // "IHAVEOPT"
    0x00, 0x03,
];

type Conn = ReadWrite<PipeReader, PipeWriter>;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn test_server(exports: Vec<(&str, Vec<u8>, bool)>) -> Arc<Server<MemBlocks>> {
    let exports = exports
        .into_iter()
        .map(|(name, data, read_only)| {
            Export::new(name, MemBlocks::new(data), read_only).unwrap()
        })
        .collect();
    Arc::new(Server::new(Registry::from_exports(exports).unwrap()))
}

/// Open one client connection to `server`, with the server side running on
/// its own thread.
fn spawn_conn(server: &Arc<Server<MemBlocks>>) -> Conn {
    let (server_rd, client_wr) = pipe::pipe();
    let (client_rd, server_wr) = pipe::pipe();
    let server = Arc::clone(server);
    thread::spawn(move || {
        let mut stream = ReadWrite::new(server_rd, server_wr);
        // errors here are what several tests provoke on purpose
        let _ = server.handle_client(&mut stream);
    });
    ReadWrite::new(client_rd, client_wr)
}

fn connect(exports: Vec<(&str, Vec<u8>, bool)>) -> Conn {
    spawn_conn(&test_server(exports))
}

/// Read the greeting, check it byte for byte, and send back the
/// fixed-newstyle client flags.
fn shake_hands(conn: &mut Conn) {
    let mut greeting = [0u8; 18];
    conn.read_exact(&mut greeting).unwrap();
    assert_eq!(greeting, GREETING);
    conn.write_u32::<BE>(0x3).unwrap();
}

fn send_opt(conn: &mut Conn, option: u32, data: &[u8]) {
    conn.write_u64::<BE>(IHAVEOPT).unwrap();
    conn.write_u32::<BE>(option).unwrap();
    conn.write_u32::<BE>(data.len() as u32).unwrap();
    conn.write_all(data).unwrap();
}

fn go_data(name: &[u8]) -> Vec<u8> {
    let mut data = vec![];
    data.write_u32::<BE>(name.len() as u32).unwrap();
    data.extend_from_slice(name);
    data.write_u16::<BE>(0).unwrap();
    data
}

fn read_opt_reply(conn: &mut Conn) -> (u32, u32, Vec<u8>) {
    assert_eq!(conn.read_u64::<BE>().unwrap(), OPTION_REPLY_MAGIC);
    let option = conn.read_u32::<BE>().unwrap();
    let reply_type = conn.read_u32::<BE>().unwrap();
    let len = conn.read_u32::<BE>().unwrap();
    let mut data = vec![0u8; len as usize];
    conn.read_exact(&mut data).unwrap();
    (option, reply_type, data)
}

/// Send GO for `name` and assert the INFO + ACK sequence; returns the
/// advertised (size, transmission flags).
fn go(conn: &mut Conn, name: &[u8]) -> (u64, u16) {
    send_opt(conn, OPT_GO, &go_data(name));
    let (option, reply_type, data) = read_opt_reply(conn);
    assert_eq!((option, reply_type), (OPT_GO, REP_INFO));
    assert_eq!(data.len(), 12);
    let mut data = &data[..];
    assert_eq!(data.read_u16::<BE>().unwrap(), 0); // NBD_INFO_EXPORT
    let size = data.read_u64::<BE>().unwrap();
    let flags = data.read_u16::<BE>().unwrap();
    let (option, reply_type, data) = read_opt_reply(conn);
    assert_eq!((option, reply_type), (OPT_GO, REP_ACK));
    assert!(data.is_empty());
    (size, flags)
}

fn send_req(conn: &mut Conn, typ: u16, handle: u64, offset: u64, len: u32, data: &[u8]) {
    conn.write_u32::<BE>(REQUEST_MAGIC).unwrap();
    conn.write_u16::<BE>(0).unwrap(); // command flags
    conn.write_u16::<BE>(typ).unwrap();
    conn.write_u64::<BE>(handle).unwrap();
    conn.write_u64::<BE>(offset).unwrap();
    conn.write_u32::<BE>(len).unwrap();
    conn.write_all(data).unwrap();
}

fn read_simple_reply(conn: &mut Conn, payload_len: usize) -> (u32, u64, Vec<u8>) {
    assert_eq!(conn.read_u32::<BE>().unwrap(), SIMPLE_REPLY_MAGIC);
    let err = conn.read_u32::<BE>().unwrap();
    let handle = conn.read_u64::<BE>().unwrap();
    let mut data = vec![0u8; payload_len];
    conn.read_exact(&mut data).unwrap();
    (err, handle, data)
}

fn read_chunk(conn: &mut Conn) -> (u16, u16, u64, Vec<u8>) {
    assert_eq!(conn.read_u32::<BE>().unwrap(), STRUCTURED_REPLY_MAGIC);
    let flags = conn.read_u16::<BE>().unwrap();
    let typ = conn.read_u16::<BE>().unwrap();
    let handle = conn.read_u64::<BE>().unwrap();
    let len = conn.read_u32::<BE>().unwrap();
    let mut data = vec![0u8; len as usize];
    conn.read_exact(&mut data).unwrap();
    (flags, typ, handle, data)
}

fn expect_eof(conn: &mut Conn) {
    let mut byte = [0u8; 1];
    assert_eq!(
        conn.read(&mut byte).unwrap(),
        0,
        "expected the server to close the connection"
    );
}

#[test]
fn greeting_is_fixed_newstyle() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    let mut greeting = [0u8; 18];
    conn.read_exact(&mut greeting).unwrap();
    assert_eq!(greeting, GREETING);
}

#[test]
fn newstyle_only_client_is_rejected() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    let mut greeting = [0u8; 18];
    conn.read_exact(&mut greeting).unwrap();
    conn.write_u32::<BE>(0x2).unwrap(); // NO_ZEROES without FIXED_NEWSTYLE
    expect_eof(&mut conn);
}

#[test]
fn fixed_newstyle_alone_is_rejected() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    let mut greeting = [0u8; 18];
    conn.read_exact(&mut greeting).unwrap();
    conn.write_u32::<BE>(0x1).unwrap();
    expect_eof(&mut conn);
}

#[test]
fn list_then_abort() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    shake_hands(&mut conn);
    send_opt(&mut conn, OPT_LIST, &[]);
    let (option, reply_type, data) = read_opt_reply(&mut conn);
    assert_eq!((option, reply_type), (OPT_LIST, REP_SERVER));
    let mut expected = vec![0, 0, 0, 7];
    expected.extend_from_slice(b"default");
    assert_eq!(data, expected);
    let (option, reply_type, data) = read_opt_reply(&mut conn);
    assert_eq!((option, reply_type), (OPT_LIST, REP_ACK));
    assert!(data.is_empty());
    send_opt(&mut conn, OPT_ABORT, &[]);
    expect_eof(&mut conn);
}

#[test]
fn list_replies_are_stable() {
    let mut conn = connect(vec![
        ("default", pattern(1024), false),
        ("scratch", pattern(512), false),
    ]);
    shake_hands(&mut conn);
    let mut runs = vec![];
    for _ in 0..3 {
        send_opt(&mut conn, OPT_LIST, &[]);
        let mut replies = vec![];
        loop {
            let reply = read_opt_reply(&mut conn);
            let done = reply.1 == REP_ACK;
            replies.push(reply);
            if done {
                break;
            }
        }
        runs.push(replies);
    }
    assert_eq!(runs[0].len(), 3); // two SERVER replies and an ACK
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
}

#[test]
fn go_default_and_read() {
    let data = pattern(1024);
    let mut conn = connect(vec![("default", data.clone(), false)]);
    shake_hands(&mut conn);
    let (size, flags) = go(&mut conn, b"");
    assert_eq!(size, 1024);
    assert_eq!(flags, 0x1); // HAS_FLAGS
    send_req(&mut conn, CMD_READ, 0x1122334455667788, 0, 16, &[]);
    let (err, handle, payload) = read_simple_reply(&mut conn, 16);
    assert_eq!(err, 0);
    assert_eq!(handle, 0x1122334455667788);
    assert_eq!(payload, data[..16]);
}

#[test]
fn go_by_name() {
    let data = pattern(512);
    let mut conn = connect(vec![
        ("default", pattern(1024), false),
        ("scratch", data.clone(), false),
    ]);
    shake_hands(&mut conn);
    let (size, _) = go(&mut conn, b"scratch");
    assert_eq!(size, 512);
    send_req(&mut conn, CMD_READ, 1, 100, 8, &[]);
    let (_, _, payload) = read_simple_reply(&mut conn, 8);
    assert_eq!(payload, data[100..108]);
}

#[test]
fn structured_read() {
    let data = pattern(1024);
    let mut conn = connect(vec![("default", data.clone(), false)]);
    shake_hands(&mut conn);
    send_opt(&mut conn, OPT_STRUCTURED_REPLY, &[]);
    let (option, reply_type, _) = read_opt_reply(&mut conn);
    assert_eq!((option, reply_type), (OPT_STRUCTURED_REPLY, REP_ACK));
    go(&mut conn, b"");
    send_req(&mut conn, CMD_READ, 0xabcd, 512, 32, &[]);
    let (flags, typ, handle, payload) = read_chunk(&mut conn);
    assert_eq!(flags, 0x1); // DONE
    assert_eq!(typ, 0x1); // OFFSET_DATA
    assert_eq!(handle, 0xabcd);
    assert_eq!(payload.len(), 40);
    assert_eq!(payload[..8], 512u64.to_be_bytes());
    assert_eq!(payload[8..], data[512..544]);
}

#[test]
fn structured_write_ack() {
    let mut conn = connect(vec![("default", vec![0u8; 1024], false)]);
    shake_hands(&mut conn);
    send_opt(&mut conn, OPT_STRUCTURED_REPLY, &[]);
    read_opt_reply(&mut conn);
    go(&mut conn, b"");
    send_req(&mut conn, CMD_WRITE, 5, 0, 8, &[1, 2, 3, 4, 5, 6, 7, 8]);
    let (flags, typ, handle, payload) = read_chunk(&mut conn);
    assert_eq!(flags, 0x1); // DONE
    assert_eq!(typ, 0x0); // NONE
    assert_eq!(handle, 5);
    assert!(payload.is_empty());
}

#[test]
fn go_unknown_export() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    shake_hands(&mut conn);
    send_opt(&mut conn, OPT_GO, &go_data(b"foo"));
    let (option, reply_type, _) = read_opt_reply(&mut conn);
    assert_eq!((option, reply_type), (OPT_GO, REP_ERR_UNKNOWN));
    expect_eof(&mut conn);
}

#[test]
fn go_with_lying_name_length() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    shake_hands(&mut conn);
    let mut data = vec![];
    data.write_u32::<BE>(10).unwrap();
    data.extend_from_slice(b"hi");
    send_opt(&mut conn, OPT_GO, &data);
    let (option, reply_type, _) = read_opt_reply(&mut conn);
    assert_eq!((option, reply_type), (OPT_GO, REP_ERR_UNKNOWN));
    expect_eof(&mut conn);
}

#[test]
fn unknown_option_is_recoverable() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    shake_hands(&mut conn);
    send_opt(&mut conn, 0xff, &[]);
    let (option, reply_type, _) = read_opt_reply(&mut conn);
    assert_eq!((option, reply_type), (0xff, REP_ERR_UNSUP));
    // the option sub-phase carries on as if nothing happened
    send_opt(&mut conn, OPT_LIST, &[]);
    let (option, reply_type, _) = read_opt_reply(&mut conn);
    assert_eq!((option, reply_type), (OPT_LIST, REP_SERVER));
    let (_, reply_type, _) = read_opt_reply(&mut conn);
    assert_eq!(reply_type, REP_ACK);
}

#[test]
fn list_with_payload_is_invalid() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    shake_hands(&mut conn);
    send_opt(&mut conn, OPT_LIST, &[0]);
    let (option, reply_type, _) = read_opt_reply(&mut conn);
    assert_eq!((option, reply_type), (OPT_LIST, REP_ERR_INVALID));
    expect_eof(&mut conn);
}

#[test]
fn write_then_disconnect() {
    let mut conn = connect(vec![("default", vec![0u8; 1024], false)]);
    shake_hands(&mut conn);
    go(&mut conn, b"");
    send_req(&mut conn, CMD_WRITE, 7, 0, 8, &[0, 1, 2, 3, 4, 5, 6, 7]);
    let (err, handle, _) = read_simple_reply(&mut conn, 0);
    assert_eq!(err, 0);
    assert_eq!(handle, 7);
    // the write went through to the export
    send_req(&mut conn, CMD_READ, 8, 0, 8, &[]);
    let (err, _, payload) = read_simple_reply(&mut conn, 8);
    assert_eq!(err, 0);
    assert_eq!(payload, [0, 1, 2, 3, 4, 5, 6, 7]);
    send_req(&mut conn, CMD_DISCONNECT, 9, 0, 0, &[]);
    expect_eof(&mut conn);
}

#[test]
fn read_only_export_advertises_and_enforces() {
    let mut conn = connect(vec![("default", pattern(1024), true)]);
    shake_hands(&mut conn);
    let (_, flags) = go(&mut conn, b"");
    assert_eq!(flags, 0x3); // HAS_FLAGS | READ_ONLY
    send_req(&mut conn, CMD_WRITE, 1, 0, 4, &[9, 9, 9, 9]);
    expect_eof(&mut conn);
}

#[test]
fn offset_wraps_modulo_size() {
    let data = pattern(1024);
    let mut conn = connect(vec![("default", data.clone(), false)]);
    shake_hands(&mut conn);
    go(&mut conn, b"");
    send_req(&mut conn, CMD_READ, 2, 1024 + 5, 4, &[]);
    let (err, _, payload) = read_simple_reply(&mut conn, 4);
    assert_eq!(err, 0);
    assert_eq!(payload, data[5..9]);
}

#[test]
fn read_past_end_is_fatal() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    shake_hands(&mut conn);
    go(&mut conn, b"");
    send_req(&mut conn, CMD_READ, 3, 1020, 16, &[]);
    expect_eof(&mut conn);
}

#[test]
fn unknown_command_is_fatal() {
    let mut conn = connect(vec![("default", pattern(1024), false)]);
    shake_hands(&mut conn);
    go(&mut conn, b"");
    send_req(&mut conn, 4, 1, 0, 0, &[]); // NBD_CMD_TRIM, unsupported
    expect_eof(&mut conn);
}

#[test]
fn writes_are_isolated_between_exports() {
    let server = test_server(vec![
        ("a", pattern(256), false),
        ("b", vec![0u8; 256], false),
    ]);

    let mut conn = spawn_conn(&server);
    shake_hands(&mut conn);
    go(&mut conn, b"a");
    send_req(&mut conn, CMD_WRITE, 1, 0, 8, &[0xff; 8]);
    let (err, _, _) = read_simple_reply(&mut conn, 0);
    assert_eq!(err, 0);

    let mut conn = spawn_conn(&server);
    shake_hands(&mut conn);
    go(&mut conn, b"b");
    send_req(&mut conn, CMD_READ, 2, 0, 8, &[]);
    let (err, _, payload) = read_simple_reply(&mut conn, 8);
    assert_eq!(err, 0);
    assert_eq!(payload, [0u8; 8]);
}

#[test]
fn client_round_trip() {
    let server = test_server(vec![("default", vec![0u8; 4096], false)]);
    let conn = spawn_conn(&server);
    let mut client = Client::new(conn, "", false).unwrap();
    assert_eq!(client.size(), 4096);
    assert!(!client.read_only());
    client.write(128, &pattern(64)).unwrap();
    assert_eq!(client.read(128, 64).unwrap(), pattern(64));
    client.disconnect().unwrap();
}

#[test]
fn structured_client_round_trip() {
    let server = test_server(vec![("default", vec![0u8; 4096], false)]);
    let conn = spawn_conn(&server);
    let mut client = Client::new(conn, "", true).unwrap();
    client.write(1024, &pattern(256)).unwrap();
    assert_eq!(client.read(1024, 256).unwrap(), pattern(256));
    client.disconnect().unwrap();
}

#[test]
fn client_list() {
    let server = test_server(vec![
        ("default", vec![0u8; 64], false),
        ("scratch", vec![0u8; 64], false),
    ]);
    let names = Client::list(spawn_conn(&server)).unwrap();
    assert_eq!(names, vec!["default", "scratch"]);
}
