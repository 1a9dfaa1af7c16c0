use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use super::client::{Client, ClientOptions, Pool};
use super::heartbeat::{Heartbeat, Stethoscope};
use super::message::{Command, Envelope, Message};

fn run_async_test<F>(future: F) -> Result<(), String>
where
    F: std::future::Future<Output = Result<(), String>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("Failed to build runtime: {}", err))?;
    runtime.block_on(future)
}

fn fast_options() -> ClientOptions {
    ClientOptions {
        timeout: Duration::from_millis(100),
        timeout_max_overflow: Duration::from_millis(300),
        timeout_overflows: 1,
    }
}

async fn bind_test_listener() -> Result<(TcpListener, String), String> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|err| format!("Failed to bind test listener: {}", err))?;
    let addr = listener
        .local_addr()
        .map_err(|err| format!("Failed to read local addr: {}", err))?
        .to_string();
    Ok((listener, addr))
}

#[test]
fn message_roundtrip_preserves_fields() -> Result<(), String> {
    let mut message = Message::with_command(Command::Run);
    message.insert("agents", serde_json::Value::from(3));
    message.insert("run_id", serde_json::Value::String("abc".to_owned()));

    let raw = message
        .serialize()
        .map_err(|err| format!("Serialize failed: {}", err))?;
    let decoded = Message::parse(&raw).map_err(|err| format!("Parse failed: {}", err))?;

    if decoded != message {
        return Err("Round-trip changed the message".to_owned());
    }
    if decoded.command() != Some(Command::Run) {
        return Err("Command did not survive the round-trip".to_owned());
    }
    if decoded.get_u64("agents") != Some(3) {
        return Err("agents field did not survive the round-trip".to_owned());
    }
    Ok(())
}

#[test]
fn command_vocabulary_is_total() -> Result<(), String> {
    for raw in [
        "PING",
        "RUN",
        "STATUS",
        "_STATUS",
        "STOP",
        "STOPRUN",
        "QUIT",
        "LIST",
        "LISTRUNS",
        "GET_DATA",
        "GET_COUNTS",
        "GET_METADATA",
        "REGISTER",
        "UNREGISTER",
    ] {
        let command = Command::parse(raw).ok_or_else(|| format!("{} did not parse", raw))?;
        if command.as_str() != raw {
            return Err(format!("{} did not round-trip", raw));
        }
    }
    if Command::parse("FROBNICATE").is_some() {
        return Err("Unknown commands must not parse".to_owned());
    }
    Ok(())
}

#[test]
fn heartbeat_registers_then_beats_without_losses() -> Result<(), String> {
    run_async_test(async {
        let mut heartbeat = Heartbeat::new("127.0.0.1:0", Duration::from_millis(50), 3);
        heartbeat
            .start()
            .await
            .map_err(|err| format!("Heartbeat start failed: {}", err))?;
        let endpoint = heartbeat
            .local_addr()
            .ok_or("Heartbeat did not report its address")?
            .to_string();

        let beats = Arc::new(AtomicUsize::new(0));
        let registers = Arc::new(AtomicUsize::new(0));
        let losses = Arc::new(AtomicUsize::new(0));

        let mut stethoscope = Stethoscope::new(
            &endpoint,
            Duration::from_millis(10),
            Duration::from_millis(120),
            2,
        );
        let beat_count = Arc::clone(&beats);
        stethoscope.on_beat(move || {
            beat_count.fetch_add(1, Ordering::SeqCst);
        });
        let register_count = Arc::clone(&registers);
        stethoscope.on_register(move || {
            register_count.fetch_add(1, Ordering::SeqCst);
        });
        let loss_count = Arc::clone(&losses);
        stethoscope.on_beat_lost(move || {
            loss_count.fetch_add(1, Ordering::SeqCst);
            false
        });
        stethoscope
            .start()
            .await
            .map_err(|err| format!("Stethoscope start failed: {}", err))?;

        tokio::time::sleep(Duration::from_millis(500)).await;
        if beats.load(Ordering::SeqCst) == 0 {
            return Err("Expected at least one beat".to_owned());
        }
        if registers.load(Ordering::SeqCst) == 0 {
            return Err("Expected at least one register broadcast".to_owned());
        }
        if losses.load(Ordering::SeqCst) != 0 {
            return Err("Loss fired while the publisher was alive".to_owned());
        }

        heartbeat.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        if losses.load(Ordering::SeqCst) == 0 {
            return Err("Loss did not fire after the publisher stopped".to_owned());
        }

        stethoscope.stop();
        Ok(())
    })
}

#[test]
fn stethoscope_restarts_after_stop() -> Result<(), String> {
    run_async_test(async {
        let mut heartbeat = Heartbeat::new("127.0.0.1:0", Duration::from_millis(40), 5);
        heartbeat
            .start()
            .await
            .map_err(|err| format!("Heartbeat start failed: {}", err))?;
        let endpoint = heartbeat
            .local_addr()
            .ok_or("Heartbeat did not report its address")?
            .to_string();

        let beats = Arc::new(AtomicUsize::new(0));
        let mut stethoscope = Stethoscope::new(
            &endpoint,
            Duration::from_millis(10),
            Duration::from_millis(100),
            3,
        );
        let beat_count = Arc::clone(&beats);
        stethoscope.on_beat(move || {
            beat_count.fetch_add(1, Ordering::SeqCst);
        });

        stethoscope
            .start()
            .await
            .map_err(|err| format!("First start failed: {}", err))?;
        tokio::time::sleep(Duration::from_millis(200)).await;
        stethoscope.stop();
        if stethoscope.is_running() {
            return Err("Stethoscope still running after stop".to_owned());
        }

        let before = beats.load(Ordering::SeqCst);
        stethoscope
            .start()
            .await
            .map_err(|err| format!("Restart failed: {}", err))?;
        if !stethoscope.is_running() {
            return Err("Stethoscope not running after restart".to_owned());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        if beats.load(Ordering::SeqCst) <= before {
            return Err("No beats received after restart".to_owned());
        }

        stethoscope.stop();
        heartbeat.stop();
        Ok(())
    })
}

#[test]
fn client_times_out_when_nothing_replies() -> Result<(), String> {
    run_async_test(async {
        let (listener, addr) = bind_test_listener().await?;
        // Accept and hold the connection without ever replying.
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let client = Client::connect(&addr, fast_options())
            .await
            .map_err(|err| format!("Connect failed: {}", err))?;
        match client
            .execute_with_timeout(
                Message::with_command(Command::Ping),
                Some(Duration::from_millis(100)),
            )
            .await
        {
            Err(err) if err.is_timeout() => Ok(()),
            Err(err) => Err(format!("Expected a timeout, got: {}", err)),
            Ok(_) => Err("Expected a timeout, got a reply".to_owned()),
        }
    })
}

#[test]
fn client_surfaces_remote_errors() -> Result<(), String> {
    run_async_test(async {
        let (listener, addr) = bind_test_listener().await?;
        tokio::spawn(async move {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            if lines.next_line().await.is_err() {
                return;
            }
            let reply = Envelope::new(Message::error("boom", Some("broker")));
            let Ok(mut payload) = serde_json::to_string(&reply) else {
                return;
            };
            payload.push('\n');
            let _unused = write_half.write_all(payload.as_bytes()).await;
        });

        let client = Client::connect(&addr, fast_options())
            .await
            .map_err(|err| format!("Connect failed: {}", err))?;
        match client.execute(Message::with_command(Command::Ping)).await {
            Err(err) if err.to_string().contains("boom") => Ok(()),
            Err(err) => Err(format!("Expected the remote error, got: {}", err)),
            Ok(_) => Err("Expected an error, got a reply".to_owned()),
        }
    })
}

#[test]
fn a_timed_out_call_never_pairs_with_a_stale_reply() -> Result<(), String> {
    run_async_test(async {
        let (listener, addr) = bind_test_listener().await?;
        tokio::spawn(async move {
            // The first connection answers far too late; replacements answer
            // promptly. Sockets stay open so stale bytes remain readable.
            let mut late = Some(Duration::from_millis(250));
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let delay = late.take();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    if lines.next_line().await.is_err() {
                        return;
                    }
                    let text = if delay.is_some() { "stale" } else { "fresh" };
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    let reply = Envelope::new(Message::result(serde_json::Value::String(
                        text.to_owned(),
                    )));
                    let Ok(mut payload) = serde_json::to_string(&reply) else {
                        return;
                    };
                    payload.push('\n');
                    let _unused = write_half.write_all(payload.as_bytes()).await;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        let client = Client::connect(&addr, fast_options())
            .await
            .map_err(|err| format!("Connect failed: {}", err))?;

        match client
            .execute_with_timeout(
                Message::with_command(Command::Ping),
                Some(Duration::from_millis(100)),
            )
            .await
        {
            Err(err) if err.is_timeout() => {}
            Err(err) => return Err(format!("Expected a timeout, got: {}", err)),
            Ok(value) => return Err(format!("Expected a timeout, got reply: {}", value)),
        }

        let value = client
            .execute(Message::with_command(Command::Ping))
            .await
            .map_err(|err| format!("Second call failed: {}", err))?;
        if value != serde_json::Value::String("fresh".to_owned()) {
            return Err(format!("Stale reply answered a new request: {}", value));
        }
        Ok(())
    })
}

#[test]
fn pool_replaces_a_failed_connection() -> Result<(), String> {
    run_async_test(async {
        let (listener, addr) = bind_test_listener().await?;
        tokio::spawn(async move {
            // First connection: read the request, then hang up mid-call.
            if let Ok((stream, _)) = listener.accept().await {
                let (read_half, _write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                let _unused = lines.next_line().await;
            }
            // Replacement connection: behave like a broker.
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            if lines.next_line().await.is_err() {
                return;
            }
            let reply = Envelope::new(Message::result(serde_json::Value::String(
                "pong".to_owned(),
            )));
            let Ok(mut payload) = serde_json::to_string(&reply) else {
                return;
            };
            payload.push('\n');
            let _unused = write_half.write_all(payload.as_bytes()).await;
        });

        let pool = Pool::connect(&addr, 1, fast_options())
            .await
            .map_err(|err| format!("Pool connect failed: {}", err))?;

        if pool
            .execute(Message::with_command(Command::Ping), None)
            .await
            .is_ok()
        {
            return Err("First call should have failed".to_owned());
        }

        let value = pool
            .execute(Message::with_command(Command::Ping), None)
            .await
            .map_err(|err| format!("Second call failed: {}", err))?;
        if value != serde_json::Value::String("pong".to_owned()) {
            return Err(format!("Unexpected reply: {}", value));
        }
        Ok(())
    })
}
