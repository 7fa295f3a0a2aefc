use std::net::Ipv4Addr;
use std::str::FromStr;

use usernet::{Config, Stack};

fn main() {
    env_logger::init();

    let stack = Stack::new(Config::from_env()).unwrap();

    let server = std::env::args().nth(1).unwrap_or("10.0.0.5:9090".into());
    let (addr, port) = server.split_once(':').expect("ADDR:PORT");
    let addr = Ipv4Addr::from_str(addr).unwrap();
    let port: u16 = port.parse().unwrap();

    let fd = stack.socket();

    println!(">>> Connecting to {addr}:{port}...");
    stack.connect(fd, addr, port).unwrap();
    println!(">>> Connected!");

    stack.send(fd, b"hello from usernet\n").unwrap();

    let mut buf = [0u8; 1500];
    loop {
        let n = stack.recv(fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }

        println!(
            ">>> Read: {:?}",
            String::from_iter(buf[..n].iter().map(|c| *c as char))
        );

        stack.send(fd, &buf[..n]).unwrap();
    }

    stack.close(fd).unwrap();
}
