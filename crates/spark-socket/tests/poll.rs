//! 阻塞轮询：跨多次接收识别应答、超时恢复回调、定向轮询单个对端。

mod support;

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use parking_lot::Mutex;
use spark_socket::{Connection, StateMachine, TcpClient, TcpServer, UdpEndpoint, UdpOptions};
use support::{Collected, fast_config, recording_context, wait_until};

/// 逐字节识别固定应答。
#[derive(Debug)]
struct Expect {
    pattern: &'static [u8],
    seen: Vec<u8>,
}

impl Expect {
    fn factory(pattern: &'static [u8]) -> impl FnMut() -> Option<Expect> + Send + 'static {
        move || {
            Some(Expect {
                pattern,
                seen: Vec::new(),
            })
        }
    }
}

impl StateMachine<u8> for Expect {
    fn apply(&mut self, input: &u8) -> bool {
        self.seen.push(*input);
        self.pattern.starts_with(&self.seen)
    }

    fn is_finished(&self) -> bool {
        self.seen == self.pattern
    }
}

fn attach(server: &TcpServer, client: &TcpClient, peers: usize) -> bool {
    wait_until(|| client.is_connected() && server.endpoints().len() == peers)
}

#[test]
fn poll_matches_reply_split_across_chunks() -> Result<()> {
    let (ctx, _) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;
    let responder = server.clone();
    server.set_on_receive_from(move |_, peer| {
        responder.send_to(b"xx123", peer);
        responder.send_to(b"45", peer);
    });

    let client = TcpClient::connect(&ctx, "127.0.0.1", server.local_addr().port());
    ensure!(attach(&server, &client, 1), "客户端应接入服务端");

    let matched = client
        .poll(b"ping", support::WAIT, Expect::factory(b"12345"))
        .context("应在超时前识别出应答")?;
    assert_eq!(matched.seen, b"12345");

    ctx.stop_all();
    Ok(())
}

#[test]
fn timeout_returns_none_and_restores_callback() -> Result<()> {
    let (ctx, _) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;
    let client = TcpClient::connect(&ctx, "127.0.0.1", server.local_addr().port());
    ensure!(attach(&server, &client, 1), "客户端应接入服务端");

    let received = Collected::default();
    client.set_on_receive(received.sink());

    let timeout = Duration::from_millis(200);
    let started = Instant::now();
    let matched = client.poll(b"ping", timeout, Expect::factory(b"never"));
    let elapsed = started.elapsed();

    ensure!(matched.is_none(), "无应答时应返回 None");
    ensure!(elapsed >= timeout, "不应早于超时返回: {elapsed:?}");
    ensure!(elapsed < Duration::from_secs(3), "不应远超超时: {elapsed:?}");

    ensure!(server.send(b"after"), "广播应返回 true");
    ensure!(received.wait_for(b"after"), "原回调应恢复，实际收到 {:?}", received.snapshot());

    ctx.stop_all();
    Ok(())
}

#[test]
fn bytes_arriving_during_poll_bypass_the_user_callback() -> Result<()> {
    let (ctx, _) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;
    let responder = server.clone();
    server.set_on_receive(move |_| {
        responder.send(b"ack");
    });

    let client = TcpClient::connect(&ctx, "127.0.0.1", server.local_addr().port());
    ensure!(attach(&server, &client, 1), "客户端应接入服务端");
    let user_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&user_hits);
    client.set_on_receive(move |_: Bytes| {
        hits.fetch_add(1, Ordering::SeqCst);
    });

    let matched = client.poll(b"ping", support::WAIT, Expect::factory(b"ack"));
    ensure!(matched.is_some(), "应识别出 ack");
    assert_eq!(user_hits.load(Ordering::SeqCst), 0, "应答只应进入匹配器");

    ctx.stop_all();
    Ok(())
}

#[test]
fn poll_peer_sends_only_to_the_target() -> Result<()> {
    let (ctx, _) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;
    let port = server.local_addr().port();

    let quiet = TcpClient::connect(&ctx, "127.0.0.1", port);
    ensure!(attach(&server, &quiet, 1), "第一个客户端应接入");
    let target = TcpClient::connect(&ctx, "127.0.0.1", port);
    ensure!(attach(&server, &target, 2), "第二个客户端应接入");

    let quiet_hits = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&quiet_hits);
    quiet.set_on_receive(move |_| {
        hits.fetch_add(1, Ordering::SeqCst);
    });
    let replier = target.clone();
    target.set_on_receive(move |_| {
        replier.send(b"pong-target");
    });

    let target_addr = target.local_addr().context("目标客户端应有本端地址")?;
    let matched = server
        .poll_peer(b"ping", support::WAIT, Expect::factory(b"pong-target"), target_addr)
        .context("目标对端应在超时前应答")?;
    assert_eq!(matched.seen, b"pong-target");
    assert_eq!(quiet_hits.load(Ordering::SeqCst), 0, "非目标对端不应收到请求");

    let unknown: SocketAddr = "127.0.0.1:1".parse().context("解析地址")?;
    let started = Instant::now();
    ensure!(
        server
            .poll_peer(b"ping", support::WAIT, Expect::factory(b"x"), unknown)
            .is_none(),
        "未知对端的轮询应返回 None"
    );
    ensure!(started.elapsed() < support::WAIT, "请求发送失败时应立即返回");

    ctx.stop_all();
    Ok(())
}

#[test]
fn concurrent_polls_on_one_connection_run_one_at_a_time() -> Result<()> {
    let (ctx, _) = recording_context(fast_config())?;
    let loopback: SocketAddr = "127.0.0.1:0".parse().context("解析回环地址")?;
    let echo = UdpEndpoint::bind_with(&ctx, loopback, None, UdpOptions::default())
        .context("绑定应答端")?;

    // 应答延迟发出；若两次轮询并发，两个请求都会先于任何应答被记录。
    let log: Arc<Mutex<Vec<String>>> = Arc::default();
    let responder = echo.clone();
    let journal = Arc::clone(&log);
    echo.set_on_receive_from(move |request, source| {
        journal
            .lock()
            .push(String::from_utf8_lossy(&request).into_owned());
        let responder = responder.clone();
        let journal = Arc::clone(&journal);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            let reply = [&b"rep-"[..], &request[4..]].concat();
            journal
                .lock()
                .push(String::from_utf8_lossy(&reply).into_owned());
            responder.send_to(&reply, source);
        });
    });

    let client = UdpEndpoint::connect(&ctx, "127.0.0.1", echo.local_addr().port())
        .context("创建带默认目标的端点")?;
    let (first, second) = std::thread::scope(|scope| {
        let a = scope.spawn(|| client.poll(b"req-a", support::WAIT, Expect::factory(b"rep-a")));
        let b = scope.spawn(|| client.poll(b"req-b", support::WAIT, Expect::factory(b"rep-b")));
        (a.join(), b.join())
    });
    let first = first.map_err(|_| anyhow::anyhow!("轮询线程 a 不应 panic"))?;
    let second = second.map_err(|_| anyhow::anyhow!("轮询线程 b 不应 panic"))?;

    assert_eq!(first.context("a 应收到自己的应答")?.seen, b"rep-a");
    assert_eq!(second.context("b 应收到自己的应答")?.seen, b"rep-b");

    let log = log.lock().clone();
    ensure!(
        log == ["req-a", "rep-a", "req-b", "rep-b"] || log == ["req-b", "rep-b", "req-a", "rep-a"],
        "第二个请求应在第一次轮询结束后才发出，实际顺序 {log:?}"
    );

    ctx.stop_all();
    Ok(())
}
