//! 多对端服务端的端到端行为：往返、接入顺序、摘除、自愈与停止。

mod support;

use std::net::{SocketAddr, TcpStream};

use anyhow::{Context, Result, ensure};
use spark_socket::{Connection, DiagnosticKind, SocketConfig, SocketContext, TcpClient, TcpServer};
use support::{Collected, fast_config, recording_context, wait_until};

/// 连接一个客户端并等到服务端链上出现它。
fn attach(ctx: &SocketContext, server: &TcpServer, expected_peers: usize) -> Result<TcpClient> {
    let client = TcpClient::connect(ctx, "127.0.0.1", server.local_addr().port());
    ensure!(
        wait_until(|| client.is_connected() && server.endpoints().len() == expected_peers),
        "客户端应在超时前接入服务端"
    );
    Ok(client)
}

fn local(client: &TcpClient) -> Result<SocketAddr> {
    client.local_addr().context("已连接客户端应有本端地址")
}

#[test]
fn bytes_round_trip_in_both_directions() -> Result<()> {
    let (ctx, _) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;
    let inbound = Collected::default();
    server.set_on_receive(inbound.sink());

    let client = attach(&ctx, &server, 1)?;
    let outbound = Collected::default();
    client.set_on_receive(outbound.sink());

    ensure!(client.send(b"hello "), "客户端发送应成功");
    ensure!(client.send(b"world"), "客户端发送应成功");
    ensure!(inbound.wait_for(b"hello world"), "服务端累计收到 {:?}", inbound.snapshot());

    ensure!(server.send(b"pong"), "广播应返回 true");
    ensure!(outbound.wait_for(b"pong"), "客户端累计收到 {:?}", outbound.snapshot());

    ctx.stop_all();
    Ok(())
}

#[test]
fn annotated_callback_reports_peer_address() -> Result<()> {
    let (ctx, _) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;
    let sources = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = std::sync::Arc::clone(&sources);
    server.set_on_receive_from(move |_, peer| sink.lock().push(peer));

    let client = attach(&ctx, &server, 1)?;
    ensure!(client.send(b"x"), "客户端发送应成功");
    ensure!(wait_until(|| !sources.lock().is_empty()), "带地址回调应被触发");
    assert_eq!(sources.lock()[0], local(&client)?);

    ctx.stop_all();
    Ok(())
}

#[test]
fn closing_first_peer_leaves_second_reachable() -> Result<()> {
    let (ctx, recorder) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;

    let first = attach(&ctx, &server, 1)?;
    first.set_reconnect(false);
    let second = attach(&ctx, &server, 2)?;
    let first_addr = local(&first)?;
    let second_addr = local(&second)?;

    let endpoints = server.endpoints();
    assert_eq!(endpoints, vec![first_addr, second_addr], "端点应按接入顺序排列");
    assert_ne!(endpoints[0], endpoints[1]);

    let received = Collected::default();
    second.set_on_receive(received.sink());

    ensure!(server.close_peer(first_addr), "应能关闭第一个对端");
    ensure!(!server.close_peer(first_addr), "重复关闭应返回 false");
    assert_eq!(server.endpoints(), vec![second_addr]);
    ensure!(wait_until(|| !first.is_connected()), "被关闭的客户端应观察到断开");

    ensure!(!server.send_to(b"lost", first_addr), "已摘除的对端不可寻址");
    ensure!(server.send_to(b"direct;", second_addr), "单发应成功");
    ensure!(server.send(b"all"), "广播应返回 true");
    ensure!(received.wait_for(b"direct;all"), "第二个对端累计收到 {:?}", received.snapshot());
    assert_eq!(recorder.count(DiagnosticKind::PeerRemoved), 1);

    ctx.stop_all();
    Ok(())
}

#[test]
fn chain_heals_when_a_peer_disconnects() -> Result<()> {
    let (ctx, _) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;

    let first = attach(&ctx, &server, 1)?;
    let second = attach(&ctx, &server, 2)?;
    let third = attach(&ctx, &server, 3)?;
    let (first_addr, third_addr) = (local(&first)?, local(&third)?);

    second.stop();
    ensure!(
        wait_until(|| server.endpoints() == vec![first_addr, third_addr]),
        "中间节点应被摘除，剩余 {:?}",
        server.endpoints()
    );
    ensure!(server.is_connected(), "仍有对端时服务端应为已连接");

    first.stop();
    third.stop();
    ensure!(wait_until(|| !server.is_connected()), "全部对端离开后服务端应为未连接");
    ensure!(server.is_connecting(), "接受循环应继续运行");

    ctx.stop_all();
    Ok(())
}

#[test]
fn peer_whose_write_fails_is_removed_from_the_chain() -> Result<()> {
    let config = SocketConfig {
        write_timeout_ms: 50,
        ..fast_config()
    };
    let (ctx, recorder) = recording_context(config)?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;
    let port = server.local_addr().port();

    // 从不读取的对端：内核缓冲写满后，写超时即为写失败。
    let stalled = TcpStream::connect(("127.0.0.1", port)).context("连接服务端")?;
    ensure!(wait_until(|| server.endpoints().len() == 1), "对端应接入");

    let payload = vec![0u8; 64 << 20];
    ensure!(server.send(&payload), "广播应返回 true");
    ensure!(server.endpoints().is_empty(), "写失败的对端应被摘除");
    ensure!(!server.is_connected(), "链为空时服务端应为未连接");
    ensure!(recorder.count(DiagnosticKind::SendFailed) >= 1, "写失败应上报诊断");
    assert_eq!(recorder.count(DiagnosticKind::PeerRemoved), 1);

    drop(stalled);
    ctx.stop_all();
    Ok(())
}

#[test]
fn stop_is_idempotent_and_releases_the_port() -> Result<()> {
    let (ctx, recorder) = recording_context(fast_config())?;
    let server = TcpServer::bind(&ctx, 0).context("绑定服务端")?;
    let port = server.local_addr().port();
    let client = attach(&ctx, &server, 1)?;
    client.set_reconnect(false);

    ensure!(ctx.registry().contains(server.id()), "构造后应已登记");
    server.stop();
    server.stop();

    ensure!(server.is_stopped(), "stop 后应处于终态");
    ensure!(!ctx.registry().contains(server.id()), "stop 后应已注销");
    ensure!(!server.is_connecting(), "接受循环应已退出");
    ensure!(server.endpoints().is_empty(), "stop 应关闭全部对端");
    ensure!(!server.send(b"late"), "停止后的广播应返回 false");
    assert_eq!(recorder.count(DiagnosticKind::Stopped), 1);
    ensure!(wait_until(|| !client.is_connected()), "对端应观察到断开");

    let rebound = TcpServer::bind(&ctx, port).context("stop 后端口应可重新绑定")?;
    rebound.stop();
    client.stop();
    Ok(())
}
