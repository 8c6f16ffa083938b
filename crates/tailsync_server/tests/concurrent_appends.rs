//! Appends from several clients against one running server.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use tailsync_protocol::{
    encode_frame, FrameHeader, FrameKind, Request, Response, HEADER_LEN, PROTOCOL_VERSION,
};
use tailsync_server::{BackgroundServer, ServerConfig};

struct RawClient {
    stream: TcpStream,
}

impl RawClient {
    fn connect(server: &BackgroundServer) -> Self {
        let mut client = Self {
            stream: TcpStream::connect(server.addr()).unwrap(),
        };
        let welcome = client.call(&Request::Hello {
            protocol_version: PROTOCOL_VERSION,
        });
        assert!(matches!(welcome, Response::Welcome { .. }));
        client
    }

    fn send_frame(&mut self, kind: FrameKind, payload: &[u8]) {
        self.stream
            .write_all(&encode_frame(kind, payload).unwrap())
            .unwrap();
    }

    fn recv(&mut self) -> Response {
        let mut raw = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut raw).unwrap();
        let header = FrameHeader::decode(&raw).unwrap();
        assert_eq!(header.kind, FrameKind::Control);
        let mut payload = vec![0u8; header.len];
        self.stream.read_exact(&mut payload).unwrap();
        Response::decode(&payload).unwrap()
    }

    fn call(&mut self, request: &Request) -> Response {
        self.send_frame(FrameKind::Control, &request.encode().unwrap());
        self.recv()
    }

    fn append(&mut self, path: &str, chunks: &[&[u8]]) -> Response {
        let ready = self.call(&Request::Append {
            path: path.to_string(),
        });
        assert_eq!(ready, Response::Ready);
        for chunk in chunks {
            self.send_frame(FrameKind::Data, chunk);
        }
        self.send_frame(FrameKind::End, &[]);
        self.recv()
    }
}

#[test]
fn appends_never_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), dir.path());
    let server = BackgroundServer::start(config).unwrap();

    let writers: Vec<_> = [b'a', b'b', b'c', b'd']
        .into_iter()
        .map(|byte| {
            let mut client = RawClient::connect(&server);
            thread::spawn(move || {
                let chunk = vec![byte; 1000];
                for _ in 0..10 {
                    let chunks = vec![chunk.as_slice(); 8];
                    let response = client.append("/shared/log.txt", &chunks);
                    assert!(matches!(response, Response::Appended { bytes: 8000, .. }));
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let content = std::fs::read(dir.path().join("shared/log.txt")).unwrap();
    assert_eq!(content.len(), 4 * 10 * 8000);
    // Every 8000-byte append is one run of a single byte.
    for block in content.chunks(8000) {
        assert!(block.iter().all(|b| *b == block[0]));
    }
}

#[test]
fn session_survives_between_requests() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap(), dir.path());
    let server = BackgroundServer::start(config).unwrap();
    let mut client = RawClient::connect(&server);

    client.append("f", &[&b"one"[..]]);
    client.append("f", &[&b"two"[..]]);
    assert_eq!(
        client.call(&Request::Size { path: "f".into() }),
        Response::Size { size: Some(6) }
    );
    assert_eq!(client.call(&Request::Quit), Response::Goodbye);
}
