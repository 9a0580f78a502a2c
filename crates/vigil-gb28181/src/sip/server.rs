//! 信令服务：UDP 收发循环、注册鉴权、MANSCDP 分发、点播会话管理。

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelInfo, InviteOptions, MediaInfo};
use crate::config::GbConfig;
use crate::device::{Device, DeviceSnapshot, DeviceStatus, Registry, MAX_REGISTER_COUNT};
use crate::error::{GbError, Result};
use crate::media::server::MediaServer;
use crate::media::{IngestSink, MediaObserver};
use crate::port_pool::{PortPool, Transport};
use crate::sip::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use crate::sip::sdp::{self, SdpOffer};
use crate::sip::{auth, rand_branch, rand_digits};
use crate::xml;

/// 注册有效期，秒。回给设备的 Expires。
const REGISTER_VALIDITY: u64 = 3600;
/// 设备超过心跳周期三倍没有任何消息就标离线。
const HEARTBEAT_INTERVAL: u64 = 60;
/// 注册封禁的解封周期，秒。
const REMOVE_BAN_INTERVAL: u64 = 600;
/// 下行请求等设备响应的上限。
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// 实时点播失败后的补拉次数与间隔。
const INVITE_RETRY_MAX: u32 = 5;
const INVITE_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct SignalingServer {
    conf: GbConfig,
    registry: Arc<Registry>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    /// 在途下行请求，按 Call-ID 等最终响应。
    pending: DashMap<String, oneshot::Sender<SipResponse>>,
    udp_pool: PortPool,
    tcp_pool: PortPool,
    media_servers: DashMap<String, Arc<MediaServer>>,
    sink: Arc<dyn IngestSink>,
    shutdown: watch::Sender<bool>,
    stopped: watch::Receiver<bool>,
}

impl SignalingServer {
    pub async fn bind(conf: GbConfig, sink: Arc<dyn IngestSink>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((conf.listen_addr.as_str(), conf.sip_port)).await?;
        let local_addr = socket.local_addr()?;
        let port_min = conf.media.listen_port + 1;
        let port_max = conf.media.listen_port + conf.media.multi_port_max_increment;
        let (shutdown, stopped) = watch::channel(false);
        let server = Arc::new(SignalingServer {
            udp_pool: PortPool::new(Transport::Udp, &conf.listen_addr, port_min, port_max),
            tcp_pool: PortPool::new(Transport::Tcp, &conf.listen_addr, port_min, port_max),
            conf,
            registry: Arc::new(Registry::new()),
            socket: Arc::new(socket),
            local_addr,
            pending: DashMap::new(),
            media_servers: DashMap::new(),
            sink,
            shutdown,
            stopped,
        });
        info!(target: "gb28181::sip", addr = %local_addr, "signaling server bound");
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn device_snapshots(&self) -> Vec<DeviceSnapshot> {
        self.registry.snapshots().await
    }

    /// 起收发循环和巡检任务。
    pub fn start(self: &Arc<Self>) {
        let srv = self.clone();
        tokio::spawn(async move { srv.recv_loop().await });

        let srv = self.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs((srv.conf.keepalive_interval / 2).max(1));
            let mut tick = tokio::time::interval(period);
            let mut stopped = srv.stopped.clone();
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        srv.registry
                            .status_sweep(srv.conf.keepalive_interval, HEARTBEAT_INTERVAL)
                            .await;
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        if self.conf.requires_auth() {
            let srv = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(REMOVE_BAN_INTERVAL));
                let mut stopped = srv.stopped.clone();
                loop {
                    tokio::select! {
                        _ = tick.tick() => srv.registry.clear_banned(),
                        _ = stopped.changed() => break,
                    }
                }
            });
        }
    }

    /// 停掉所有任务和收流服务。
    pub fn dispose(&self) {
        let _ = self.shutdown.send(true);
        for server in self.media_servers.iter() {
            server.stop();
        }
        self.media_servers.clear();
        info!(target: "gb28181::sip", "signaling server disposed");
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65535];
        let mut stopped = self.stopped.clone();
        loop {
            let (len, addr) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(target: "gb28181::sip", error = %e, "recv failed");
                        continue;
                    }
                },
                _ = stopped.changed() => break,
            };
            match SipMessage::from_bytes(&buf[..len]) {
                Ok(SipMessage::Request(req)) => {
                    let srv = self.clone();
                    tokio::spawn(async move { srv.handle_request(req, addr).await });
                }
                Ok(SipMessage::Response(resp)) => self.route_response(resp),
                Err(e) => debug!(target: "gb28181::sip", %addr, error = %e, "unparsable datagram"),
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, req: SipRequest, addr: SocketAddr) {
        debug!(target: "gb28181::sip", method = %req.method, %addr, "request");
        match req.method {
            SipMethod::Register => self.on_register(req, addr).await,
            SipMethod::Message => self.on_message(req, addr).await,
            SipMethod::Notify => self.on_notify(req, addr).await,
            SipMethod::Bye => self.on_bye(req, addr).await,
            // 设备对我们响应的确认，不用回。
            SipMethod::Ack => {}
            _ => self.respond(&req, addr, 405, "Method Not Allowed").await,
        }
    }

    /// 设备对下行请求的最终响应按 Call-ID 投递；1xx 只记日志。
    fn route_response(&self, resp: SipResponse) {
        let Some(call_id) = resp.call_id() else {
            return;
        };
        if resp.status_code < 200 {
            debug!(target: "gb28181::sip", call_id, status = resp.status_code, "provisional response");
            return;
        }
        if let Some((_, tx)) = self.pending.remove(call_id) {
            let _ = tx.send(resp);
        }
    }

    // --- 注册 ---

    async fn on_register(self: &Arc<Self>, req: SipRequest, addr: SocketAddr) {
        // 没带 Expires 的注册无法判断意图，直接忽略。
        let Some(expires) = req.expires() else {
            debug!(target: "gb28181::sip", %addr, "register without expires ignored");
            return;
        };
        let Some(device_id) = req.from_user() else {
            self.respond(&req, addr, 400, "Bad Request").await;
            return;
        };
        if device_id.len() != 20 {
            self.respond(&req, addr, 400, "Bad Request").await;
            return;
        }

        if self.conf.requires_auth() {
            if self.registry.is_banned(&device_id) {
                self.respond(&req, addr, 403, "Forbidden").await;
                return;
            }
            match req.header("Authorization").and_then(auth::parse_authorization) {
                None => {
                    // 首轮：下发挑战，不计失败。
                    let nonce = self.registry.nonce_for(&device_id);
                    let mut resp = SipResponse::from_request(&req, 401, "Unauthorized");
                    resp.set_header("WWW-Authenticate", auth::www_authenticate(&self.conf.realm, &nonce));
                    self.send_response(resp, addr).await;
                    return;
                }
                Some(params) => {
                    let nonce = self.registry.current_nonce(&device_id).unwrap_or_default();
                    // 用户名允许配置值或设备自身编码。
                    let users: Vec<&str> = if self.conf.username.is_empty() {
                        vec![device_id.as_str()]
                    } else {
                        vec![self.conf.username.as_str(), device_id.as_str()]
                    };
                    if nonce.is_empty()
                        || !auth::verify(&params, &users, &self.conf.password, &self.conf.realm, &nonce)
                    {
                        let count = self.registry.bump_register_count(&device_id);
                        if count > MAX_REGISTER_COUNT {
                            warn!(target: "gb28181::sip", device = %device_id, "register banned");
                            self.respond(&req, addr, 403, "Forbidden").await;
                            return;
                        }
                        let nonce = self.registry.nonce_for(&device_id);
                        let mut resp = SipResponse::from_request(&req, 401, "Unauthorized");
                        resp.set_header(
                            "WWW-Authenticate",
                            auth::www_authenticate(&self.conf.realm, &nonce),
                        );
                        self.send_response(resp, addr).await;
                        return;
                    }
                }
            }
        }

        self.registry.clear_register_state(&device_id);
        if expires == 0 {
            if self.registry.remove_device(&device_id).is_some() {
                info!(target: "gb28181::sip", device = %device_id, "device unregistered");
            }
            self.respond(&req, addr, 200, "OK").await;
            return;
        }

        let device = self.registry.store_device(&device_id, addr).await;
        let mut resp = SipResponse::from_request(&req, 200, "OK");
        resp.set_header("Expires", REGISTER_VALIDITY.to_string());
        resp.set_header("Date", Local::now().format("%Y-%m-%dT%H:%M:%S").to_string());
        self.send_response(resp, addr).await;

        let srv = self.clone();
        tokio::spawn(async move {
            srv.sync_channels(device.clone()).await;
            srv.query_device_info(&device).await;
        });
    }

    // --- MANSCDP ---

    async fn on_message(self: &Arc<Self>, req: SipRequest, addr: SocketAddr) {
        let Some(body) = req.body.as_deref() else {
            self.respond(&req, addr, 400, "Bad Request").await;
            return;
        };
        let msg = match xml::parse_manscdp(body) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(target: "gb28181::sip", %addr, error = %e, "bad manscdp body");
                self.respond(&req, addr, 400, "Bad Request").await;
                return;
            }
        };

        let device = match self.registry.device(&msg.device_id) {
            Some(device) => device,
            None if msg.cmd_type == "Keepalive" && self.conf.quick_login => {
                let device = self.registry.recover_device(&msg.device_id, addr).await;
                let srv = self.clone();
                let dev = device.clone();
                tokio::spawn(async move {
                    srv.sync_channels(dev.clone()).await;
                    srv.query_device_info(&dev).await;
                });
                device
            }
            None => {
                self.respond(&req, addr, 400, "Device Not Found").await;
                return;
            }
        };

        // 任何来信都算设备活着：刷新时间，离线的拉回在线。
        {
            let mut state = device.state.write().await;
            state.update_time = chrono::Utc::now();
            if state.status == DeviceStatus::Offline {
                state.status = DeviceStatus::Online;
            }
        }

        match msg.cmd_type.as_str() {
            "Keepalive" => {
                device.mark_keepalive().await;
                device.state.write().await.status = DeviceStatus::Online;
                self.respond(&req, addr, 200, "OK").await;
            }
            "Catalog" => {
                for item in msg.device_list.items {
                    self.merge_catalog_item(&device, item.into_channel_info()).await;
                }
                device.state.write().await.status = DeviceStatus::Online;
                info!(
                    target: "gb28181::sip",
                    device = %device.id,
                    channels = device.channels.len(),
                    "catalog updated"
                );
                self.respond(&req, addr, 200, "OK").await;
            }
            "DeviceInfo" => {
                let mut state = device.state.write().await;
                if !msg.device_name.is_empty() {
                    state.name = msg.device_name;
                }
                if !msg.manufacturer.is_empty() {
                    state.manufacturer = msg.manufacturer;
                }
                if !msg.model.is_empty() {
                    state.model = msg.model;
                }
                if !msg.firmware.is_empty() {
                    state.firmware = msg.firmware;
                }
                drop(state);
                self.respond(&req, addr, 200, "OK").await;
            }
            "Alarm" => {
                device.state.write().await.status = DeviceStatus::Alarmed;
                let mut resp = SipResponse::from_request(&req, 200, "OK");
                resp.set_body(
                    "Application/MANSCDP+xml",
                    xml::alarm_response(msg.sn, &msg.device_id),
                );
                self.send_response(resp, addr).await;
            }
            other => {
                debug!(target: "gb28181::sip", cmd = other, "unhandled message cmdtype");
                self.respond(&req, addr, 400, "Bad Request").await;
            }
        }
    }

    async fn on_notify(self: &Arc<Self>, req: SipRequest, addr: SocketAddr) {
        let Some(body) = req.body.as_deref() else {
            self.respond(&req, addr, 400, "Bad Request").await;
            return;
        };
        let msg = match xml::parse_manscdp(body) {
            Ok(msg) => msg,
            Err(_) => {
                self.respond(&req, addr, 400, "Bad Request").await;
                return;
            }
        };

        match msg.cmd_type.as_str() {
            "Catalog" => {
                let Some(device) = self.registry.device(&msg.device_id) else {
                    self.respond(&req, addr, 400, "Device Not Found").await;
                    return;
                };
                for item in msg.device_list.items {
                    match item.event.as_str() {
                        "ON" | "OFF" | "VLOST" | "DEFECT" => {
                            device.set_channel_status(&item.device_id, &item.event).await;
                        }
                        "DEL" => device.remove_channel(&item.device_id),
                        // ADD/UPDATE 或没带事件的都按目录项入库。
                        _ => {
                            self.merge_catalog_item(&device, item.into_channel_info()).await;
                        }
                    }
                }
                self.respond(&req, addr, 200, "OK").await;
            }
            "Keepalive" => {
                // 少数设备用 NOTIFY 发心跳。
                if let Some(device) = self.registry.device(&msg.device_id) {
                    device.mark_keepalive().await;
                    device.state.write().await.status = DeviceStatus::Online;
                }
                self.respond(&req, addr, 200, "OK").await;
            }
            "MobilePosition" => {
                // 时间用服务器时钟，设备时钟不可信。
                let now = Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
                if let Some((_, channel)) = self.registry.find_channel_anywhere(&msg.device_id) {
                    let mut gps = channel.gps.write().await;
                    gps.longitude = msg.longitude;
                    gps.latitude = msg.latitude;
                    gps.time = now;
                } else if let Some(device) = self.registry.device(&msg.device_id) {
                    let mut state = device.state.write().await;
                    state.gps.longitude = msg.longitude;
                    state.gps.latitude = msg.latitude;
                    state.gps.time = now;
                }
                self.respond(&req, addr, 200, "OK").await;
            }
            other => {
                debug!(target: "gb28181::sip", cmd = other, "unhandled notify cmdtype");
                self.respond(&req, addr, 400, "Bad Request").await;
            }
        }
    }

    /// 设备侧主动挂断。
    async fn on_bye(self: &Arc<Self>, req: SipRequest, addr: SocketAddr) {
        if let Some(call_id) = req.call_id() {
            if let Some(channel) = self.registry.find_channel_by_call_id(call_id).await {
                info!(target: "gb28181::sip", call_id, "device hung up");
                self.clear_session(&channel).await;
            }
        }
        self.respond(&req, addr, 200, "OK").await;
    }

    // --- 下行请求 ---

    async fn create_request(
        &self,
        device: &Device,
        method: SipMethod,
        to_id: &str,
    ) -> (SipRequest, SocketAddr) {
        let addr = device.state.read().await.net_addr;
        let mut req = SipRequest::new(method, format!("sip:{}@{}", to_id, addr));
        req.set_header(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};rport;branch={}",
                self.conf.sip_ip,
                self.local_addr.port(),
                rand_branch()
            ),
        );
        req.set_header(
            "From",
            format!("<sip:{}@{}>;tag={}", self.conf.serial, self.conf.realm, rand_digits(9)),
        );
        req.set_header("To", format!("<sip:{}@{}>", to_id, self.conf.realm));
        req.set_header("Call-ID", rand_digits(10));
        req.set_header("CSeq", format!("{} {}", device.next_sn(), method));
        req.set_header("Max-Forwards", "70");
        req.set_header("User-Agent", "vigil-gb28181");
        req.set_header(
            "Contact",
            format!("<sip:{}@{}:{}>", self.conf.serial, self.conf.sip_ip, self.local_addr.port()),
        );
        (req, addr)
    }

    async fn request_and_wait(&self, req: &SipRequest, addr: SocketAddr) -> Result<SipResponse> {
        let call_id = req
            .call_id()
            .ok_or_else(|| GbError::Sip("request without call-id".to_string()))?
            .to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.clone(), tx);
        self.socket.send_to(&req.to_bytes(), addr).await?;
        match timeout(RESPONSE_TIMEOUT, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            _ => {
                self.pending.remove(&call_id);
                Err(GbError::Timeout)
            }
        }
    }

    /// 目录项入库。ParentID 可能是行政区划路径，按最后一段解析：
    /// 指向别的已注册设备就挂到那台下面（NVR 替下挂 IPC 代报目录），
    /// 指向未知设备则留在上报设备下并标记 NoParent。
    async fn merge_catalog_item(&self, device: &Arc<Device>, mut info: ChannelInfo) {
        let parent = info.parent_id.rsplit('/').next().unwrap_or("").to_string();
        if !parent.is_empty() && parent != device.id {
            if let Some(owner) = self.registry.device(&parent) {
                owner.upsert_channel(info).await;
                return;
            }
            info.model = format!("Directory {}", info.model);
            info.status = "NoParent".to_string();
        }
        device.upsert_channel(info).await;
    }

    /// 注册/恢复后拉一次目录，2 秒窗口内去重。
    async fn sync_channels(&self, device: Arc<Device>) {
        if !device.should_sync_catalog().await {
            return;
        }
        let (mut req, addr) = self.create_request(&device, SipMethod::Message, &device.id).await;
        req.set_body(
            "Application/MANSCDP+xml",
            xml::catalog_query(device.next_sn(), &device.id),
        );
        match self.request_and_wait(&req, addr).await {
            Ok(resp) if resp.status_code == 200 => {
                debug!(target: "gb28181::sip", device = %device.id, "catalog query accepted")
            }
            Ok(resp) => {
                warn!(target: "gb28181::sip", device = %device.id, status = resp.status_code, "catalog query refused")
            }
            Err(e) => {
                warn!(target: "gb28181::sip", device = %device.id, error = %e, "catalog query failed")
            }
        }
    }

    /// 对所有在线设备重拉目录。
    pub async fn sync_all_channels(&self) {
        for snapshot in self.registry.snapshots().await {
            if let Some(device) = self.registry.device(&snapshot.id) {
                self.sync_channels(device).await;
            }
        }
    }

    async fn query_device_info(&self, device: &Arc<Device>) {
        let (mut req, addr) = self.create_request(device, SipMethod::Message, &device.id).await;
        req.set_body(
            "Application/MANSCDP+xml",
            xml::device_info_query(device.next_sn(), &device.id),
        );
        if let Err(e) = self.request_and_wait(&req, addr).await {
            warn!(target: "gb28181::sip", device = %device.id, error = %e, "device info query failed");
        }
    }

    // --- 点播 ---

    /// 向通道发起点播。实时点播失败后后台补拉几次。
    pub async fn invite(
        self: &Arc<Self>,
        device_id: &str,
        channel_id: &str,
        mut opts: InviteOptions,
    ) -> Result<()> {
        let (device, channel) = self.registry.find_channel(device_id, channel_id)?;
        if opts.is_live() {
            if !channel.can_invite().await {
                return Err(GbError::InviteInProgress(channel_id.to_string()));
            }
            if !channel.begin_invite() {
                return Err(GbError::InviteInProgress(channel_id.to_string()));
            }
        }
        match self.do_invite(&device, &channel, &mut opts).await {
            Ok(()) => {
                if opts.is_live() {
                    channel.set_playing();
                }
                info!(target: "gb28181::sip", device = device_id, channel = channel_id, ssrc = %opts.ssrc, "invite ok");
                Ok(())
            }
            Err(e) => {
                warn!(target: "gb28181::sip", device = device_id, channel = channel_id, error = %e, "invite failed");
                // 回放没占用邀约位，失败也不能动实时会话的媒体上下文。
                if opts.is_live() {
                    self.clear_session(&channel).await;
                    self.spawn_invite_retry(device_id, channel_id);
                }
                Err(e)
            }
        }
    }

    fn spawn_invite_retry(self: &Arc<Self>, device_id: &str, channel_id: &str) {
        let srv = self.clone();
        let device_id = device_id.to_string();
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            for attempt in 1..=INVITE_RETRY_MAX {
                tokio::time::sleep(INVITE_RETRY_DELAY).await;
                let Ok((device, channel)) = srv.registry.find_channel(&device_id, &channel_id)
                else {
                    break;
                };
                if !channel.can_invite().await || !channel.begin_invite() {
                    break;
                }
                let mut opts = InviteOptions::default();
                match srv.do_invite(&device, &channel, &mut opts).await {
                    Ok(()) => {
                        channel.set_playing();
                        info!(target: "gb28181::sip", channel = %channel_id, attempt, "invite retry ok");
                        break;
                    }
                    Err(e) => {
                        srv.clear_session(&channel).await;
                        warn!(target: "gb28181::sip", channel = %channel_id, attempt, error = %e, "invite retry failed");
                    }
                }
            }
        });
    }

    async fn do_invite(
        self: &Arc<Self>,
        device: &Arc<Device>,
        channel: &Arc<Channel>,
        opts: &mut InviteOptions,
    ) -> Result<()> {
        let channel_id = channel.info.read().await.channel_id.clone();
        opts.create_ssrc(&self.conf.serial);
        let transport: Transport = self.conf.sip_network.parse()?;
        let (port, media_key) = self.ensure_media_server(transport, &device.id, &channel_id).await?;
        opts.media_port = port;

        let offer = SdpOffer {
            channel_id: &channel_id,
            media_ip: &self.conf.media.media_ip,
            media_port: port,
            session_name: opts.session_name(),
            start: opts.start,
            end: opts.end,
            ssrc: &opts.ssrc,
            tcp: transport == Transport::Tcp,
        }
        .build();

        let (mut req, addr) = self.create_request(device, SipMethod::Invite, &channel_id).await;
        req.set_header(
            "Subject",
            format!("{}:{},{}:0", channel_id, opts.ssrc, self.conf.serial),
        );
        req.set_body("application/sdp", offer);
        let call_id = req.call_id().unwrap_or_default().to_string();

        let resp = self.request_and_wait(&req, addr).await?;
        if resp.status_code != 200 {
            return Err(GbError::InviteRejected(resp.status_code));
        }

        let answer = resp
            .body
            .as_deref()
            .map(|b| sdp::parse_answer(&String::from_utf8_lossy(b)))
            .unwrap_or_default();
        if let Some(ssrc) = answer.ssrc {
            if ssrc != 0 && ssrc != opts.ssrc_num {
                debug!(target: "gb28181::sip", offered = opts.ssrc_num, answered = ssrc, "device rewrote ssrc");
                opts.ssrc_num = ssrc;
            }
        }
        // 发的是 TCP 邀约但设备只走 UDP：在同一端口再开一个 UDP 收流入口兜底。
        if transport == Transport::Tcp && !answer.tcp {
            if let Ok(listener) = self.udp_pool.bind_port(port).await {
                let server = MediaServer::start(
                    &media_key,
                    port,
                    listener,
                    self.conf.media.single_port,
                    Arc::downgrade(self) as Weak<dyn MediaObserver>,
                    self.sink.clone(),
                );
                self.media_servers.insert(format!("udp-fallback-{}", media_key), server);
            }
        }

        self.send_ack(&req, &resp, addr).await;

        let mut media = channel.media.write().await;
        media.is_invite = true;
        media.ssrc = opts.ssrc_num;
        media.stream_name = format!("{}_{}", device.id, channel_id);
        media.single_port = self.conf.media.single_port;
        media.media_key = media_key;
        media.call_id = call_id;
        media.transport = transport.to_string();
        Ok(())
    }

    /// ACK 属于 INVITE 事务：同 Call-ID、同 CSeq 序号、To 带设备回的 tag。
    async fn send_ack(&self, invite: &SipRequest, resp: &SipResponse, addr: SocketAddr) {
        let mut ack = SipRequest::new(SipMethod::Ack, invite.uri.clone());
        ack.set_header(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};rport;branch={}",
                self.conf.sip_ip,
                self.local_addr.port(),
                rand_branch()
            ),
        );
        for name in ["From", "Call-ID"] {
            if let Some(value) = invite.header(name) {
                ack.set_header(name, value);
            }
        }
        if let Some(to) = resp.header("To") {
            ack.set_header("To", to);
        }
        let seq = invite.cseq().map(|(seq, _)| seq).unwrap_or(1);
        ack.set_header("CSeq", format!("{} ACK", seq));
        ack.set_header("Max-Forwards", "70");
        if let Err(e) = self.socket.send_to(&ack.to_bytes(), addr).await {
            warn!(target: "gb28181::sip", error = %e, "ack send failed");
        }
    }

    /// 平台侧主动挂断。
    pub async fn bye(&self, device_id: &str, channel_id: &str) -> Result<()> {
        let (device, channel) = self.registry.find_channel(device_id, channel_id)?;
        self.send_bye(&device, &channel).await;
        self.clear_session(&channel).await;
        Ok(())
    }

    async fn send_bye(&self, device: &Arc<Device>, channel: &Arc<Channel>) {
        let (channel_id, call_id) = {
            let info = channel.info.read().await;
            let media = channel.media.read().await;
            (info.channel_id.clone(), media.call_id.clone())
        };
        let (mut req, addr) = self.create_request(device, SipMethod::Bye, &channel_id).await;
        if !call_id.is_empty() {
            req.set_header("Call-ID", call_id);
        }
        if let Err(e) = self.socket.send_to(&req.to_bytes(), addr).await {
            warn!(target: "gb28181::sip", error = %e, "bye send failed");
        }
    }

    /// 清会话：媒体上下文、邀约占用、多端口模式下的收流服务。
    /// 失败的邀约可能已经起了收流服务但还没写入媒体上下文，
    /// 所以注册键从通道编码推，而不是从媒体上下文取。
    async fn clear_session(&self, channel: &Arc<Channel>) {
        channel.media.write().await.clear();
        channel.reset_invite();
        if !self.conf.media.single_port {
            let channel_id = channel.info.read().await.channel_id.clone();
            let key = format!("{}{}", channel.device_id, channel_id);
            for key in [key.clone(), format!("udp-fallback-{}", key)] {
                if let Some((_, server)) = self.media_servers.remove(&key) {
                    server.stop();
                }
            }
        }
    }

    /// 起（或复用）收流服务，返回端口和注册键。
    async fn ensure_media_server(
        self: &Arc<Self>,
        transport: Transport,
        device_id: &str,
        channel_id: &str,
    ) -> Result<(u16, String)> {
        let observer = Arc::downgrade(self) as Weak<dyn MediaObserver>;
        if self.conf.media.single_port {
            let port = self.conf.media.listen_port;
            let key = format!("{}{}", transport, port);
            if !self.media_servers.contains_key(&key) {
                let pool = match transport {
                    Transport::Udp => &self.udp_pool,
                    Transport::Tcp => &self.tcp_pool,
                };
                let listener = pool.bind_port(port).await?;
                let server = MediaServer::start(&key, port, listener, true, observer, self.sink.clone());
                self.media_servers.insert(key.clone(), server);
            }
            Ok((port, key))
        } else {
            let key = format!("{}{}", device_id, channel_id);
            if let Some(server) = self.media_servers.get(&key) {
                return Ok((server.port, key));
            }
            let pool = match transport {
                Transport::Udp => &self.udp_pool,
                Transport::Tcp => &self.tcp_pool,
            };
            let (listener, port) = pool.acquire().await?;
            let server = MediaServer::start(&key, port, listener, false, observer, self.sink.clone());
            self.media_servers.insert(key.clone(), server);
            Ok((port, key))
        }
    }

    // --- 响应 ---

    async fn respond(&self, req: &SipRequest, addr: SocketAddr, code: u16, reason: &str) {
        self.send_response(SipResponse::from_request(req, code, reason), addr).await;
    }

    async fn send_response(&self, resp: SipResponse, addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(&resp.to_bytes(), addr).await {
            warn!(target: "gb28181::sip", %addr, error = %e, "response send failed");
        }
    }
}

#[async_trait]
impl MediaObserver for SignalingServer {
    async fn media_by_ssrc(&self, ssrc: u32) -> Option<MediaInfo> {
        self.registry.check_ssrc(ssrc).await.map(|(_, media)| media)
    }

    async fn media_by_key(&self, key: &str) -> Option<MediaInfo> {
        self.registry.find_media_by_key(key).await
    }

    async fn stream_closed(&self, stream_name: &str) {
        if let Some((device, channel)) = self.registry.find_channel_by_stream(stream_name).await {
            let is_invite = channel.media.read().await.is_invite;
            if is_invite {
                info!(target: "gb28181::sip", stream = stream_name, "stream lost, hanging up");
                self.send_bye(&device, &channel).await;
            }
            self.clear_session(&channel).await;
        }
    }
}
