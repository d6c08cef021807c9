use crate::echo;
use crate::scripted::{Script, Scripted};
use sockkpi::{
    Domain, KpiConfig, ProtocolHandler, Registry, SockAddr, SockKind, SockResult, SockType,
    Socket, Stack, local,
};
use std::future::Future;
use std::io::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Protocol number the scripted protocol is registered under, for Inet streams.
pub const SCRIPTED_PROTOCOL: i32 = 6;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A stack with the local protocols and the scripted protocol installed.
#[derive(Clone)]
pub struct TestBed {
    pub stack: Stack,
    pub script: Arc<Script>,
}

impl TestBed {
    pub fn new(config: Option<KpiConfig>) -> Self {
        init_logger();
        let script = Script::new();
        let shared = script.clone();
        let registry = local::register(Registry::builder())
            .register(
                Domain::Inet,
                SockType::Stream,
                SCRIPTED_PROTOCOL,
                move |_kind: SockKind| -> SockResult<Arc<dyn ProtocolHandler>> {
                    Ok(Arc::new(Scripted(shared.clone())))
                },
            )
            .build();
        TestBed {
            stack: Stack::new(registry, config),
            script,
        }
    }

    pub fn scripted(&self) -> SockResult<Socket> {
        self.stack.create(Domain::Inet, SockType::Stream, 0)
    }

    pub fn local_stream(&self) -> SockResult<Socket> {
        self.stack.create(Domain::Local, SockType::Stream, 0)
    }

    pub fn local_dgram(&self) -> SockResult<Socket> {
        self.stack.create(Domain::Local, SockType::Datagram, 0)
    }

    /// A local stream socket bound to `name` and listening.
    pub fn listener(&self, name: &str, backlog: u32) -> SockResult<Socket> {
        let so = self.local_stream()?;
        so.bind(&SockAddr::local(name)?)?;
        so.listen(backlog)?;
        Ok(so)
    }
}

/// Runs `test` against an echo server listening on the local name `name`.
///
/// # Returns
/// The number of connections the server served to completion.
pub async fn run_with_echo_server<F, Fut>(name: &str, test: F) -> Result<usize>
where
    F: FnOnce(TestBed) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let bed = TestBed::new(None);
    let listener = bed.listener(name, 0)?;
    log::info!("echo server listening on {name}");
    let token = CancellationToken::new();
    let server = {
        let (listener, token) = (listener.clone(), token.clone());
        tokio::task::spawn_blocking(move || echo::run_echo_server(&listener, token))
    };

    let outcome = test(bed.clone()).await;
    token.cancel();
    let served = server.await.map_err(Error::other)?;
    listener.close()?;
    if let Err(e) = &outcome {
        log::error!("echo test failed: {e}");
    }
    outcome?;
    served
}
