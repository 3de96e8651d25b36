//! Example control API client
//!
//! Demonstrates talking to the agent's local control socket from an external
//! application: connect, send one line-delimited JSON `ApiRequest`, read one
//! line-delimited JSON `ApiResponse` back.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use meshnode_agent::control::DEFAULT_SOCKET_PATH;

fn send(stream: &mut UnixStream, reader: &mut BufReader<UnixStream>, request: &str) -> Result<(), Box<dyn std::error::Error>> {
    writeln!(stream, "{}", request)?;
    let mut response = String::new();
    reader.read_line(&mut response)?;
    println!("Response: {}", response.trim_end());
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = PathBuf::from(DEFAULT_SOCKET_PATH);
    println!("Connecting to {:?}", socket_path);

    let mut stream = UnixStream::connect(&socket_path)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    println!("Connected!");

    println!("\n--- Status ---");
    send(&mut stream, &mut reader, r#"{"id":"req-1","action":"status"}"#)?;

    println!("\n--- Peers ---");
    send(&mut stream, &mut reader, r#"{"id":"req-2","action":"list_peers"}"#)?;

    println!("\n--- Relay sessions ---");
    send(&mut stream, &mut reader, r#"{"id":"req-3","action":"list_sessions"}"#)?;

    println!("\n--- Ingress rules ---");
    send(&mut stream, &mut reader, r#"{"id":"req-4","action":"list_ingress_rules"}"#)?;

    println!("\n--- Firewall rules ---");
    send(&mut stream, &mut reader, r#"{"id":"req-5","action":"list_firewall_rules"}"#)?;

    Ok(())
}
