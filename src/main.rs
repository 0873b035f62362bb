use tcp_engine::net::loopback::{DirectRoute, LoopbackPort};
use tcp_engine::{Config, Result, Stack, TcpListener, TcpStream, info};

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;

const CLIENT: [u8; 4] = [10, 0, 0, 1];
const SERVER: [u8; 4] = [10, 0, 0, 2];

fn host(addr: [u8; 4], port: Arc<LoopbackPort>) -> Result<Stack> {
    let route = Arc::new(DirectRoute::new(addr, 1500));
    let stack = Stack::new(Config::default(), port, route.clone(), route);
    stack.spawn_timer_thread()?;

    Ok(stack)
}

fn handle_client(mut stream: TcpStream) -> Result<()> {
    let mut buf = [0u8; 1024];

    loop {
        let nbytes = stream.read(&mut buf[..])?;
        if nbytes == 0 {
            break;
        }

        info!(
            "read {nbytes} bytes from peer: {}",
            String::from_utf8_lossy(&buf[..nbytes])
        );

        stream.write_all(&buf[..nbytes])?;
        info!("wrote {nbytes} bytes to the peer");
    }

    stream.close()
}

fn main() -> Result<()> {
    let (a, b) = LoopbackPort::pair()?;

    let client = host(CLIENT, a)?;
    let server = host(SERVER, b)?;

    let listener = TcpListener::bind(&server, (SERVER, 7), 16)?;

    let echo = thread::spawn(move || -> Result<()> {
        let stream = listener.accept()?;
        info!("accepted connection from {}", stream.peer_addr());
        handle_client(stream)
    });

    let mut stream = TcpStream::connect(&client, (SERVER, 7))?;
    info!("connected from {}", stream.local_addr());

    for line in ["hello", "over", "loopback"] {
        stream.write_all(line.as_bytes())?;

        let mut buf = [0u8; 64];
        let mut echoed = 0;
        while echoed < line.len() {
            match stream.read(&mut buf[echoed..])? {
                0 => break,
                n => echoed += n,
            }
        }

        info!("echoed: {}", String::from_utf8_lossy(&buf[..echoed]));
    }

    stream.close()?;

    match echo.join() {
        Ok(res) => res?,
        Err(_) => tcp_engine::error!("echo thread panicked"),
    }

    info!("client stats: {:?}", client.stats());
    info!("server stats: {:?}", server.stats());

    Ok(())
}
