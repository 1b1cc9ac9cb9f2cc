//! Newline-delimited JSON client for a network-attached instrument.
//!
//! Every unary call opens its own connection, writes one request line and reads
//! one reply line. Listen calls keep their connection open and read one reply
//! line per item until the token is cancelled, which shuts the socket down.
use std::io::{BufRead, BufReader, Write};
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::drivers::preset::TdrPreset;
use crate::drivers::source::{CancelToken, Instrument, Subscription};
use crate::drivers::ConsoleError;
use crate::types::{
    Frame, InstrumentState, LedId, LedSelectors, LedState, TdrConfiguration, TdrWorkingState,
};

const RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    IsReady,
    GetVersionId,
    GetState,
    GetTdrConfiguration,
    GetTdrWorkingState,
    ConfigureTdrPreset { preset: TdrPreset },
    EnableTdr { enable: bool },
    SetLed { led_id: LedId, on: bool },
    ListenToStateEvent,
    ListenToSampleStream,
    ListenToLedState { selectors: LedSelectors },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply<T> {
    Ok(T),
    Error(String),
}

impl<T> Reply<T> {
    fn into_result(self) -> Result<T, ConsoleError> {
        match self {
            Reply::Ok(value) => Ok(value),
            Reply::Error(detail) => Err(ConsoleError::Transport(detail)),
        }
    }
}

pub struct RemoteInstrument {
    address: String,
}

impl RemoteInstrument {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    fn resolve(&self) -> Result<SocketAddr, ConsoleError> {
        self.address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ConsoleError::Transport(format!("cannot resolve {}", self.address)))
    }

    fn open(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<TcpStream, ConsoleError> {
        let addr = self.resolve()?;
        let mut stream = TcpStream::connect_timeout(&addr, timeout.unwrap_or(RPC_TIMEOUT))?;
        stream.set_nodelay(true).ok();
        stream.set_write_timeout(Some(RPC_TIMEOUT))?;
        stream.set_read_timeout(timeout)?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream.write_all(line.as_bytes())?;
        Ok(stream)
    }

    fn call<T: DeserializeOwned>(&self, request: Request) -> Result<T, ConsoleError> {
        self.call_with_timeout(request, RPC_TIMEOUT)
    }

    fn call_with_timeout<T: DeserializeOwned>(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<T, ConsoleError> {
        let stream = self.open(&request, Some(timeout))?;
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(ConsoleError::Closed);
        }
        serde_json::from_str::<Reply<T>>(&line)?.into_result()
    }

    fn listen<T>(
        &self,
        request: Request,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<T>>, ConsoleError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let stream = self.open(&request, None)?;
        let handle = stream.try_clone()?;
        cancel.on_cancel(move || {
            handle.shutdown(Shutdown::Both).ok();
        });
        debug!("opened {request:?} on {}", self.address);
        Ok(Box::new(LineSubscription {
            reader: BufReader::new(stream),
            cancel: cancel.clone(),
            line: String::new(),
            _item: PhantomData,
        }))
    }
}

impl Instrument for RemoteInstrument {
    fn host(&self) -> String {
        self.address.clone()
    }

    fn is_ready(&self, timeout: Duration) -> Result<(), ConsoleError> {
        self.call_with_timeout(Request::IsReady, timeout)
    }

    fn version_id(&self) -> Result<String, ConsoleError> {
        self.call(Request::GetVersionId)
    }

    fn state(&self) -> Result<InstrumentState, ConsoleError> {
        self.call(Request::GetState)
    }

    fn tdr_configuration(&self) -> Result<TdrConfiguration, ConsoleError> {
        self.call(Request::GetTdrConfiguration)
    }

    fn tdr_working_state(&self) -> Result<TdrWorkingState, ConsoleError> {
        self.call(Request::GetTdrWorkingState)
    }

    fn configure_tdr_preset(&self, preset: TdrPreset) -> Result<(), ConsoleError> {
        self.call(Request::ConfigureTdrPreset { preset })
    }

    fn enable_tdr(&self, enable: bool) -> Result<(), ConsoleError> {
        self.call(Request::EnableTdr { enable })
    }

    fn set_led(&self, led: LedId, on: bool) -> Result<(), ConsoleError> {
        self.call(Request::SetLed { led_id: led, on })
    }

    fn listen_state_events(
        &self,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<()>>, ConsoleError> {
        self.listen(Request::ListenToStateEvent, cancel)
    }

    fn listen_sample_stream(
        &self,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<Frame>>, ConsoleError> {
        self.listen(Request::ListenToSampleStream, cancel)
    }

    fn listen_led_state(
        &self,
        selectors: LedSelectors,
        cancel: &CancelToken,
    ) -> Result<Box<dyn Subscription<LedState>>, ConsoleError> {
        self.listen(Request::ListenToLedState { selectors }, cancel)
    }
}

struct LineSubscription<T> {
    reader: BufReader<TcpStream>,
    cancel: CancelToken,
    line: String,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Subscription<T> for LineSubscription<T> {
    fn next_item(&mut self) -> Result<T, ConsoleError> {
        if self.cancel.is_cancelled() {
            return Err(ConsoleError::Cancelled);
        }
        self.line.clear();
        match self.reader.read_line(&mut self.line) {
            Ok(0) if self.cancel.is_cancelled() => Err(ConsoleError::Cancelled),
            Ok(0) => Err(ConsoleError::Closed),
            Ok(_) => serde_json::from_str::<Reply<T>>(&self.line)?.into_result(),
            Err(_) if self.cancel.is_cancelled() => Err(ConsoleError::Cancelled),
            Err(err) => Err(ConsoleError::Transport(err.to_string())),
        }
    }
}
