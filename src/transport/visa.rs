//! VISA-backed GPIB resource.
//!
//! VISA calls block, and a VISA session is tied to the thread that opened it, so
//! each [`VisaResource`] owns a dedicated worker thread holding the resource
//! manager and the session. Async callers talk to it over a channel and await a
//! oneshot reply.
//!
//! Supports resource strings like:
//! - "GPIB::15" / "GPIB0::15::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB-TMC)
//! - "TCPIP0::192.168.1.100::INSTR" (Ethernet/LXI)

use super::gpib::GpibResource;
use crate::error::{InstrumentError, InstrumentResult};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::mpsc;
use tokio::sync::oneshot;
use visa_rs::prelude::*;

const TERMINATOR: &str = "\n";

enum Request {
    Write(String, oneshot::Sender<InstrumentResult<()>>),
    Read(oneshot::Sender<InstrumentResult<String>>),
    StatusByte(oneshot::Sender<InstrumentResult<u8>>),
    Clear(oneshot::Sender<InstrumentResult<()>>),
    Close(oneshot::Sender<InstrumentResult<()>>),
}

/// GPIB session opened through the system VISA library.
pub struct VisaResource {
    resource_string: String,
    requests: mpsc::Sender<Request>,
}

impl VisaResource {
    /// Open `resource_string` on a dedicated VISA thread.
    pub async fn open(resource_string: &str) -> InstrumentResult<Self> {
        let name = CString::new(resource_string).map_err(|_| {
            InstrumentError::InvalidParameter(format!(
                "VISA resource string contains a NUL byte: {:?}",
                resource_string
            ))
        })?;

        let (requests, inbox) = mpsc::channel::<Request>();
        let (opened_tx, opened_rx) = oneshot::channel::<InstrumentResult<()>>();

        std::thread::Builder::new()
            .name(format!("visa-{}", resource_string))
            .spawn(move || {
                let session = (|| -> InstrumentResult<(DefaultRM, Instrument)> {
                    let rm = DefaultRM::new()?;
                    let expr: VisaString = name.into();
                    let rsc = rm.find_res(&expr)?;
                    let instr = rm.open(&rsc, AccessMode::NO_LOCK, TIMEOUT_IMMEDIATE)?;
                    Ok((rm, instr))
                })();

                match session {
                    Ok((_rm, instr)) => {
                        let _ = opened_tx.send(Ok(()));
                        serve(&instr, inbox);
                    }
                    Err(err) => {
                        let _ = opened_tx.send(Err(err));
                    }
                }
            })?;

        opened_rx.await.map_err(|_| {
            InstrumentError::Visa(format!("VISA thread for {} exited", resource_string))
        })??;

        Ok(Self {
            resource_string: resource_string.to_string(),
            requests,
        })
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<InstrumentResult<T>>) -> Request,
    ) -> InstrumentResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    fn gone(&self) -> InstrumentError {
        InstrumentError::Visa(format!("VISA session {} is closed", self.resource_string))
    }
}

fn serve(instr: &Instrument, inbox: mpsc::Receiver<Request>) {
    while let Ok(request) = inbox.recv() {
        match request {
            Request::Write(message, reply) => {
                let mut writer = instr;
                let result = writer
                    .write_all(format!("{}{}", message, TERMINATOR).as_bytes())
                    .map_err(InstrumentError::from);
                let _ = reply.send(result);
            }
            Request::Read(reply) => {
                let mut line = String::new();
                let result = BufReader::new(instr)
                    .read_line(&mut line)
                    .map(|_| line.trim_end_matches(['\r', '\n']).to_string())
                    .map_err(InstrumentError::from);
                let _ = reply.send(result);
            }
            Request::StatusByte(reply) => {
                let result = instr
                    .read_stb()
                    .map(|stb| (stb & 0xff) as u8)
                    .map_err(InstrumentError::from);
                let _ = reply.send(result);
            }
            Request::Clear(reply) => {
                let _ = reply.send(instr.clear().map_err(InstrumentError::from));
            }
            Request::Close(reply) => {
                let _ = reply.send(Ok(()));
                break;
            }
        }
    }
}

#[async_trait]
impl GpibResource for VisaResource {
    async fn write(&mut self, message: &str) -> InstrumentResult<()> {
        let message = message.to_string();
        self.call(|tx| Request::Write(message, tx)).await
    }

    async fn read(&mut self) -> InstrumentResult<String> {
        self.call(Request::Read).await
    }

    async fn read_status_byte(&mut self) -> InstrumentResult<u8> {
        self.call(Request::StatusByte).await
    }

    async fn clear(&mut self) -> InstrumentResult<()> {
        self.call(Request::Clear).await
    }

    async fn close(&mut self) -> InstrumentResult<()> {
        self.call(Request::Close).await
    }
}
