// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log output for the server.
//!
//! Events are formatted as
//!
//! ```text
//! logkeep | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! and written to stderr, or sent to syslog as one RFC 3164 message per
//! event (`<PRI>logkeep: LEVEL | ...`, facility daemon) when a `syslog`
//! section is configured.

use std::fmt;
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Mutex;

use tracing::Level;
use tracing_core::{Event, Metadata, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields, MakeWriter,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::SyslogConfig;

pub const TAG: &str = "logkeep";
const FACILITY_DAEMON: u8 = 3;
#[cfg(unix)]
const LOCAL_SOCKETS: [&str; 3] = ["/dev/log", "/var/run/syslog", "/var/run/log"];

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("invalid log level {level:?}: {source}")]
    Filter {
        level: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("unable to connect to syslog: {0}")]
    Syslog(#[from] io::Error),

    #[error("unable to install subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Syslog severity threshold, as named in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyslogLevel {
    Debug,
    Info,
    Notice,
    #[default]
    Warning,
    Err,
    Crit,
    Alert,
    Emerg,
}

impl SyslogLevel {
    /// Unknown names fall back to `warning`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "debug" => Self::Debug,
            "info" => Self::Info,
            "notice" => Self::Notice,
            "err" => Self::Err,
            "crit" => Self::Crit,
            "alert" => Self::Alert,
            "emerg" => Self::Emerg,
            _ => Self::Warning,
        }
    }

    pub fn level_filter(self) -> LevelFilter {
        match self {
            Self::Debug => LevelFilter::DEBUG,
            Self::Info | Self::Notice => LevelFilter::INFO,
            Self::Warning => LevelFilter::WARN,
            Self::Err | Self::Crit | Self::Alert | Self::Emerg => LevelFilter::ERROR,
        }
    }
}

/// Syslog severity of an event.
fn severity(level: &Level) -> u8 {
    match *level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        _ => 7,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter {
    /// Prefix lines with [`TAG`]. Syslog messages carry the tag in their header.
    pub with_tag: bool,
}

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        if self.with_tag {
            write!(&mut writer, "{TAG} | ")?;
        }
        write!(&mut writer, "{} | ", event.metadata().level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

enum Transport {
    Udp(UdpSocket),
    Tcp(Mutex<TcpStream>),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixDatagram),
}

impl Transport {
    fn connect(proto: &str, addr: &str) -> io::Result<Self> {
        if proto.is_empty() || addr.is_empty() {
            return Self::local();
        }
        match proto {
            "udp" => {
                let target = addr.to_socket_addrs()?.next().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("no address for {addr}"),
                    )
                })?;
                let socket = if target.is_ipv4() {
                    UdpSocket::bind("0.0.0.0:0")?
                } else {
                    UdpSocket::bind("[::]:0")?
                };
                socket.connect(target)?;
                Ok(Self::Udp(socket))
            }
            "tcp" => Ok(Self::Tcp(Mutex::new(TcpStream::connect(addr)?))),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported syslog protocol {other:?}"),
            )),
        }
    }

    #[cfg(unix)]
    fn local() -> io::Result<Self> {
        let socket = std::os::unix::net::UnixDatagram::unbound()?;
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no local syslog socket");
        for path in LOCAL_SOCKETS {
            match socket.connect(path) {
                Ok(()) => return Ok(Self::Unix(socket)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    #[cfg(not(unix))]
    fn local() -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "local syslog is only available on unix",
        ))
    }

    fn send(&self, message: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp(socket) => socket.send(message).map(|_| ()),
            Self::Tcp(stream) => {
                #[allow(clippy::expect_used)]
                let mut stream = stream.lock().expect("lock poisoned");
                stream.write_all(message)?;
                stream.write_all(b"\n")
            }
            #[cfg(unix)]
            Self::Unix(socket) => socket.send(message).map(|_| ()),
        }
    }
}

/// Hands the fmt layer one writer per event, tagged with the event severity.
pub struct SyslogMakeWriter {
    transport: Transport,
}

impl SyslogMakeWriter {
    pub fn connect(proto: &str, addr: &str) -> io::Result<Self> {
        Ok(SyslogMakeWriter {
            transport: Transport::connect(proto, addr)?,
        })
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter {
            transport: &self.transport,
            severity: severity(&Level::INFO),
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter {
            transport: &self.transport,
            severity: severity(meta.level()),
        }
    }
}

pub struct SyslogWriter<'a> {
    transport: &'a Transport,
    severity: u8,
}

impl Write for SyslogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        let priority = FACILITY_DAEMON * 8 + self.severity;
        let message = format!("<{priority}>{TAG}: {}", line.trim_end_matches('\n'));
        self.transport.send(message.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn env_filter(level: &str) -> Result<EnvFilter, LoggerError> {
    EnvFilter::try_new(format!("hyper=off,reqwest=off,{level}")).map_err(|source| {
        LoggerError::Filter {
            level: level.to_string(),
            source,
        }
    })
}

/// Builds the fmt subscriber shared by the stderr and syslog outputs.
fn subscriber<W>(
    filter: EnvFilter,
    writer: W,
    with_tag: bool,
) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .event_format(Formatter { with_tag })
        .finish()
}

/// Installs the global subscriber.
pub fn init(log_level: &str, syslog: Option<&SyslogConfig>) -> Result<(), LoggerError> {
    match syslog {
        None => {
            let subscriber = subscriber(env_filter(log_level)?, io::stderr, true);
            tracing::subscriber::set_global_default(subscriber)?;
        }
        Some(syslog) => {
            let level = syslog.level.level_filter().to_string().to_lowercase();
            let writer = SyslogMakeWriter::connect(&syslog.proto, &syslog.addr)?;
            let subscriber = subscriber(env_filter(&level)?, writer, false);
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tracing::{info, info_span, warn};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Capture {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_format_with_spans_and_fields() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = subscriber(env_filter("info").unwrap(), move || writer.clone(), true);

        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("flush", batch = 2);
            let _entered = span.enter();
            info!(nb_messages = 2, "Messages flushed");
        });

        let output = capture.contents();
        assert_eq!(
            output,
            "logkeep | INFO | flush{batch=2}: Messages flushed nb_messages=2\n"
        );
    }

    #[test]
    fn test_output_has_no_escape_codes() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = subscriber(env_filter("debug").unwrap(), move || writer.clone(), true);

        tracing::subscriber::with_default(subscriber, || {
            warn!(
                nb_messages = 3,
                error = "timeout",
                "Unable to flush messages"
            );
        });

        let output = capture.contents();
        assert!(
            !output.contains('\u{1b}'),
            "unexpected escape codes: {output:?}"
        );
        assert_eq!(
            output,
            "logkeep | WARN | Unable to flush messages nb_messages=3 error=\"timeout\"\n"
        );
    }

    #[test]
    fn test_syslog_levels() {
        assert_eq!(
            SyslogLevel::from_name("notice").level_filter(),
            LevelFilter::INFO
        );
        assert_eq!(
            SyslogLevel::from_name("CRIT").level_filter(),
            LevelFilter::ERROR
        );
        assert_eq!(SyslogLevel::from_name("bogus"), SyslogLevel::Warning);
        assert_eq!(SyslogLevel::default().level_filter(), LevelFilter::WARN);
    }

    #[test]
    fn test_syslog_over_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let writer = SyslogMakeWriter::connect("udp", &addr).unwrap();
        let subscriber = subscriber(env_filter("info").unwrap(), writer, false);
        tracing::subscriber::with_default(subscriber, || {
            warn!(nb_messages = 3, "Unable to flush messages");
        });

        let mut buf = [0u8; 1024];
        let len = server.recv(&mut buf).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..len]).unwrap(),
            "<28>logkeep: WARN | Unable to flush messages nb_messages=3"
        );
    }

    #[test]
    fn test_unknown_protocol_is_rejected() {
        assert!(SyslogMakeWriter::connect("sctp", "127.0.0.1:514").is_err());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(matches!(
            env_filter("[invalid"),
            Err(LoggerError::Filter { .. })
        ));
    }
}
