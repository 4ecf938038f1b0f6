//! In-process stand-ins for mesh hops, targets and peer-list endpoints

#![allow(dead_code)]

use pqc_tunnel::{AeadProvider, KemProvider, TunnelManager};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const REPLY_OK: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_REFUSED: [u8; 10] = [0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// A SOCKS5 hop: no-auth negotiation, an optional PQC accept, then one
/// CONNECT that it relays. Returns the listening port.
pub async fn spawn_hop<K: KemProvider, A: AeadProvider>(tunnels: Option<Arc<TunnelManager<K, A>>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (client, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let tunnels = tunnels.clone();
            tokio::spawn(async move {
                let _ = serve_hop(client, tunnels).await;
            });
        }
    });
    port
}

async fn serve_hop<K: KemProvider, A: AeadProvider>(
    mut client: TcpStream,
    tunnels: Option<Arc<TunnelManager<K, A>>>,
) -> io::Result<()> {
    let mut greeting = [0u8; 3];
    client.read_exact(&mut greeting).await?;
    if greeting != [0x05, 0x01, 0x00] {
        client.write_all(&[0x05, 0xff]).await?;
        return Ok(());
    }
    client.write_all(&[0x05, 0x00]).await?;

    if let Some(tunnels) = tunnels {
        tunnels
            .accept(&mut client)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    }

    let (host, port) = read_connect(&mut client).await?;
    match TcpStream::connect((host.as_str(), port)).await {
        Ok(mut upstream) => {
            client.write_all(&REPLY_OK).await?;
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        }
        Err(_) => {
            client.write_all(&REPLY_REFUSED).await?;
        }
    }
    Ok(())
}

async fn read_connect(stream: &mut TcpStream) -> io::Result<(String, u16)> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != 0x05 || head[1] != 0x01 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "not a CONNECT"));
    }

    let host = match head[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            Ipv4Addr::from(ip).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        }
        _ => return Err(io::Error::new(io::ErrorKind::InvalidData, "bad ATYP")),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

/// A hop that accepts no-auth negotiation and then never answers. The
/// returned receiver yields the bytes read once the client hangs up.
pub async fn spawn_stalled_hop() -> (u16, tokio::sync::oneshot::Receiver<io::Result<usize>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (mut client, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let mut greeting = [0u8; 3];
        if client.read_exact(&mut greeting).await.is_err() {
            return;
        }
        if client.write_all(&[0x05, 0x00]).await.is_err() {
            return;
        }
        let mut rest = Vec::new();
        let outcome = client.read_to_end(&mut rest).await;
        let _ = done_tx.send(outcome);
    });
    (port, done_rx)
}

/// TCP echo target
pub async fn spawn_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

/// A port with nothing listening on it
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Minimal HTTP/1.1 server answering every request with `body` as JSON
pub async fn spawn_peer_list(body: String) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    port
}
