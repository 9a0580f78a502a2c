//! 按端口起的收流服务。
//!
//! UDP 一个 socket 按来源地址分连接；TCP 每个连接一个任务，
//! 2 字节大端长度前缀分帧（RFC 4571）。30 秒没数据视为断流。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::media::conn::MediaConn;
use crate::media::{IngestSink, MediaObserver};
use crate::port_pool::PortListener;
use crate::rtp::RtpPacket;

/// 收流读超时，超过即认为设备停流。
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// UDP 收流缓冲，按以太网 MTU 内的 RTP 包上限取。
const UDP_BUF_SIZE: usize = 1472;

pub struct MediaServer {
    pub media_key: String,
    pub port: u16,
    shutdown: watch::Sender<bool>,
}

impl MediaServer {
    /// 在已绑定的端口上开始收流，返回可用于停止的句柄。
    pub fn start(
        media_key: &str,
        port: u16,
        listener: PortListener,
        single_port: bool,
        observer: Weak<dyn MediaObserver>,
        sink: Arc<dyn IngestSink>,
    ) -> Arc<MediaServer> {
        let (shutdown, stopped) = watch::channel(false);
        let server = Arc::new(MediaServer { media_key: media_key.to_string(), port, shutdown });
        let key = server.media_key.clone();
        match listener {
            PortListener::Udp(socket) => {
                tokio::spawn(udp_loop(socket, key, single_port, observer, sink, stopped));
            }
            PortListener::Tcp(listener) => {
                tokio::spawn(async move {
                    let mut stopped = stopped;
                    loop {
                        tokio::select! {
                            accepted = listener.accept() => {
                                match accepted {
                                    Ok((stream, peer)) => {
                                        debug!(target: "gb28181::media", %peer, "tcp media connection");
                                        let conn = MediaConn::new(&key, single_port, observer.clone(), sink.clone());
                                        tokio::spawn(tcp_conn_loop(stream, conn, stopped.clone()));
                                    }
                                    Err(e) => {
                                        warn!(target: "gb28181::media", error = %e, "tcp accept failed");
                                        break;
                                    }
                                }
                            }
                            _ = stopped.changed() => break,
                        }
                    }
                });
            }
        }
        info!(target: "gb28181::media", key = %server.media_key, port, "media server started");
        server
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for MediaServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct UdpConnEntry {
    conn: MediaConn,
    last_active: Instant,
}

async fn udp_loop(
    socket: UdpSocket,
    media_key: String,
    single_port: bool,
    observer: Weak<dyn MediaObserver>,
    sink: Arc<dyn IngestSink>,
    mut stopped: watch::Receiver<bool>,
) {
    let mut buf = [0u8; UDP_BUF_SIZE];
    let mut conns: HashMap<SocketAddr, UdpConnEntry> = HashMap::new();
    let mut sweep = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(target: "gb28181::media", error = %e, "udp recv failed");
                        break;
                    }
                };
                let pkt = match RtpPacket::parse(&buf[..len]) {
                    Ok(pkt) => pkt,
                    Err(e) => {
                        debug!(target: "gb28181::media", %peer, error = %e, "bad rtp datagram");
                        continue;
                    }
                };
                let entry = conns.entry(peer).or_insert_with(|| UdpConnEntry {
                    conn: MediaConn::new(&media_key, single_port, observer.clone(), sink.clone()),
                    last_active: Instant::now(),
                });
                entry.last_active = Instant::now();
                if let Err(e) = entry.conn.handle_rtp(&pkt).await {
                    warn!(target: "gb28181::media", %peer, error = %e, "udp media conn dropped");
                    if let Some(mut entry) = conns.remove(&peer) {
                        entry.conn.close().await;
                    }
                }
            }
            _ = sweep.tick() => {
                let stale: Vec<SocketAddr> = conns
                    .iter()
                    .filter(|(_, e)| e.last_active.elapsed() > READ_TIMEOUT)
                    .map(|(peer, _)| *peer)
                    .collect();
                for peer in stale {
                    if let Some(mut entry) = conns.remove(&peer) {
                        debug!(target: "gb28181::media", %peer, "udp media conn timed out");
                        entry.conn.close().await;
                    }
                }
            }
            _ = stopped.changed() => break,
        }
    }
    for (_, mut entry) in conns.drain() {
        entry.conn.close().await;
    }
}

async fn tcp_conn_loop(mut stream: TcpStream, mut conn: MediaConn, mut stopped: watch::Receiver<bool>) {
    loop {
        let frame = tokio::select! {
            framed = timeout(READ_TIMEOUT, read_framed(&mut stream)) => framed,
            _ = stopped.changed() => break,
        };
        let data = match frame {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                debug!(target: "gb28181::media", error = %e, "tcp media read failed");
                break;
            }
            Err(_) => {
                debug!(target: "gb28181::media", "tcp media read timed out");
                break;
            }
        };
        let pkt = match RtpPacket::parse(&data) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!(target: "gb28181::media", error = %e, "bad rtp frame");
                continue;
            }
        };
        if let Err(e) = conn.handle_rtp(&pkt).await {
            warn!(target: "gb28181::media", error = %e, "tcp media conn dropped");
            break;
        }
    }
    conn.close().await;
}

/// RFC 4571 分帧：2 字节大端长度 + RTP 包。读到 EOF 返回 None。
async fn read_framed(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(Some(data))
}
