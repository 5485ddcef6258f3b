#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parquet::data_type::{ByteArray, ByteArrayType, DoubleType, Int32Type, Int64Type};
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;

pub enum TestColumn {
    Double(&'static str, Vec<f64>),
    OptionalDouble(&'static str, Vec<Option<f64>>),
    Int8(&'static str, Vec<i32>),
    Int64(&'static str, Vec<i64>),
    Text(&'static str, Vec<String>),
}

pub fn write_parquet(path: &Path, columns: &[TestColumn]) {
    let mut fields = String::new();
    for col in columns {
        let line = match col {
            TestColumn::Double(name, _) => format!("REQUIRED DOUBLE {name};"),
            TestColumn::OptionalDouble(name, _) => format!("OPTIONAL DOUBLE {name};"),
            TestColumn::Int8(name, _) => format!("REQUIRED INT32 {name} (INT_8);"),
            TestColumn::Int64(name, _) => format!("REQUIRED INT64 {name};"),
            TestColumn::Text(name, _) => format!("REQUIRED BINARY {name} (UTF8);"),
        };
        fields.push_str(&line);
    }
    let message = format!("message schema {{ {fields} }}");
    let schema = Arc::new(parse_message_type(&message).expect("schema should parse"));
    let props = Arc::new(WriterProperties::builder().build());
    let file = fs::File::create(path).expect("parquet file should be creatable");
    let mut writer = SerializedFileWriter::new(file, schema, props).expect("parquet writer");
    let mut row_group = writer.next_row_group().expect("row group");

    for col in columns {
        let mut out = row_group
            .next_column()
            .expect("next column")
            .expect("column should exist");
        match col {
            TestColumn::Double(_, values) => {
                out.typed::<DoubleType>()
                    .write_batch(values, None, None)
                    .expect("write doubles");
            }
            TestColumn::OptionalDouble(_, values) => {
                let present: Vec<f64> = values.iter().flatten().copied().collect();
                let def_levels: Vec<i16> =
                    values.iter().map(|v| i16::from(v.is_some())).collect();
                out.typed::<DoubleType>()
                    .write_batch(&present, Some(&def_levels), None)
                    .expect("write optional doubles");
            }
            TestColumn::Int8(_, values) => {
                out.typed::<Int32Type>()
                    .write_batch(values, None, None)
                    .expect("write ints");
            }
            TestColumn::Int64(_, values) => {
                out.typed::<Int64Type>()
                    .write_batch(values, None, None)
                    .expect("write longs");
            }
            TestColumn::Text(_, values) => {
                let bytes: Vec<ByteArray> =
                    values.iter().map(|s| ByteArray::from(s.as_str())).collect();
                out.typed::<ByteArrayType>()
                    .write_batch(&bytes, None, None)
                    .expect("write strings");
            }
        }
        out.close().expect("close column");
    }
    row_group.close().expect("close row group");
    writer.close().expect("close parquet writer");
}

pub fn scratch_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let dir = std::env::temp_dir().join(format!(
        "numerai_pipeline_{name}_{}_{nanos}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("scratch dir should be creatable");
    dir
}

pub fn fixture_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Answers a fixed number of HTTP/1.1 requests, one per connection.
pub struct MockServer {
    addr: SocketAddr,
    rx: mpsc::Receiver<Recorded>,
}

impl MockServer {
    pub fn start<F>(requests: usize, respond: F) -> Self
    where
        F: Fn(&Recorded, &str) -> (u16, Vec<u8>) + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        let base = format!("http://{addr}");
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for _ in 0..requests {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let Some(req) = read_request(&mut stream) else {
                    continue;
                };
                let (status, body) = respond(&req, &base);
                let head = format!(
                    "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    reason(status),
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
                let _ = stream.flush();
                if tx.send(req).is_err() {
                    return;
                }
            }
        });
        Self { addr, rx }
    }

    pub fn url(&self) -> String {
        format!("http://{}/graphql", self.addr)
    }

    pub fn base(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn received(&self, n: usize) -> Vec<Recorded> {
        (0..n)
            .map(|_| {
                self.rx
                    .recv_timeout(Duration::from_secs(10))
                    .expect("mock server should have seen the request")
            })
            .collect()
    }
}

pub fn test_client() -> reqwest::blocking::Client {
    reqwest::blocking::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("test client")
}

fn read_request(stream: &mut TcpStream) -> Option<Recorded> {
    stream.set_read_timeout(Some(Duration::from_secs(10))).ok()?;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| {
            let (k, v) = l.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect();
    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    Some(Recorded {
        method,
        path,
        headers,
        body,
    })
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Status",
    }
}
