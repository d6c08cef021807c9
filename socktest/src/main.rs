use anyhow::{Context, bail};
use socktest::{echo, run_with_echo_server};
use std::env;
use std::io;

const NAME: &str = "socktest.echo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() > 2 {
        eprintln!("Usage: {} [clients]", args[0]);
        bail!("invalid number of arguments");
    }
    let clients: usize = match args.get(1) {
        Some(arg) => arg.parse().context("client count must be a number")?,
        None => 8,
    };

    let served = run_with_echo_server(NAME, |bed| async move {
        let mut tasks = Vec::with_capacity(clients);
        for i in 0..clients {
            let bed = bed.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                let message = format!("hello from client {i}");
                let reply = echo::run_echo_client(&bed, NAME, message.as_bytes())?;
                if reply != message.as_bytes() {
                    return Err(io::Error::other(format!("client {i}: echo mismatch")));
                }
                Ok(())
            }));
        }
        for task in tasks {
            task.await.map_err(io::Error::other)??;
        }
        Ok::<(), io::Error>(())
    })
    .await
    .context("echo run failed")?;

    log::info!("{served} of {clients} connections served");
    if served != clients {
        bail!("server finished {served} connections, expected {clients}");
    }
    Ok(())
}
