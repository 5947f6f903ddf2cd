//! Outbound message construction and delivery
//!
//! Each cycle the dispatcher turns the latest filtered scalars and spectra
//! into OSC messages. Per-channel mode sends one message per channel and
//! domain to an address rendered from a [`PathTemplate`]:
//!
//! ```text
//! /eeg/ch0/time  f           filtered scalar
//! /eeg/ch0/fft   f f f f ... (frequency, magnitude) pairs, flattened
//! ```
//!
//! Messages go out in ascending channel order, the time-domain message
//! before the spectrum for each channel. Bundled mode sends every scalar
//! followed by every magnitude as one message, the layout Wekinator-style
//! receivers expect.
//!
//! A failed send is counted and logged; it never stops the rest of the batch.

use crate::config::OscConfig;
use crate::selection::ChannelSelection;
use brainosc_core::{config_error, SpectralFrame, StreamError, StreamResult};
use rosc::{encoder, OscMessage, OscPacket, OscType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use tracing::debug;

/// Value domain of an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// Filtered time-domain scalar
    Time,
    /// Magnitude spectrum
    Fft,
}

impl Domain {
    /// Name substituted for `{domain}`
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Time => "time",
            Domain::Fft => "fft",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a cycle's values are packed into messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One message per channel and domain
    #[default]
    PerChannel,
    /// One message per cycle carrying every value
    Bundled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Channel,
    Domain,
}

/// OSC address template with `{n}` (channel index) and `{domain}`
/// (`time` or `fft`) placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Parse a template such as `/eeg/ch{n}/{domain}`.
    ///
    /// Both placeholders are required so that no two channels or domains
    /// share an address.
    pub fn parse(template: &str) -> StreamResult<Self> {
        if !template.starts_with('/') {
            return Err(config_error!(
                "osc.path_template must start with '/', got '{}'",
                template
            ));
        }

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                config_error!("unclosed '{{' in osc.path_template '{}'", template)
            })?;
            let segment = match &after[..close] {
                "n" => Segment::Channel,
                "domain" => Segment::Domain,
                other => {
                    return Err(config_error!(
                        "unknown placeholder '{{{}}}' in osc.path_template",
                        other
                    ))
                }
            };
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            segments.push(segment);
            rest = &after[close + 1..];
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        for segment in &segments {
            if let Segment::Literal(text) = segment {
                if let Some(bad) = text.chars().find(|c| is_reserved(*c)) {
                    return Err(config_error!(
                        "character '{}' is not allowed in an OSC address",
                        bad
                    ));
                }
            }
        }
        if !segments.contains(&Segment::Channel) || !segments.contains(&Segment::Domain) {
            return Err(config_error!(
                "osc.path_template '{}' must contain both {{n}} and {{domain}}",
                template
            ));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// Address for one channel and domain
    pub fn render(&self, channel: usize, domain: Domain) -> String {
        let mut address = String::with_capacity(self.source.len() + 4);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => address.push_str(text),
                Segment::Channel => address.push_str(&channel.to_string()),
                Segment::Domain => address.push_str(domain.as_str()),
            }
        }
        address
    }
}

fn is_reserved(c: char) -> bool {
    c.is_whitespace() || matches!(c, '#' | '*' | ',' | '?' | '[' | ']' | '{' | '}')
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Message body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// One filtered value
    Scalar(f32),
    /// (frequency, magnitude) pairs from DC to Nyquist
    Spectrum(Vec<(f32, f32)>),
    /// Flat list of values
    Values(Vec<f32>),
}

impl Payload {
    /// Spectrum payload from a spectral frame
    pub fn spectrum(frame: &SpectralFrame) -> Self {
        Payload::Spectrum(
            frame
                .bins
                .iter()
                .map(|bin| (bin.frequency as f32, bin.magnitude as f32))
                .collect(),
        )
    }

    /// Flattened float arguments
    pub fn to_osc_args(&self) -> Vec<OscType> {
        match self {
            Payload::Scalar(value) => vec![OscType::Float(*value)],
            Payload::Spectrum(pairs) => pairs
                .iter()
                .flat_map(|&(frequency, magnitude)| [OscType::Float(frequency), OscType::Float(magnitude)])
                .collect(),
            Payload::Values(values) => values.iter().map(|&v| OscType::Float(v)).collect(),
        }
    }
}

/// Encode one message as an OSC packet
pub fn encode(address: &str, payload: &Payload) -> StreamResult<Vec<u8>> {
    let packet = OscPacket::Message(OscMessage {
        addr: address.to_string(),
        args: payload.to_osc_args(),
    });
    encoder::encode(&packet).map_err(|e| StreamError::transport(address, format!("encoding failed: {:?}", e)))
}

/// Message sink
pub trait Transport {
    /// Deliver one message; must not block on the network
    fn send(&mut self, address: &str, payload: &Payload) -> StreamResult<()>;

    /// Follow a configuration change of host or port
    fn reconfigure(&mut self, _osc: &OscConfig) -> StreamResult<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, address: &str, payload: &Payload) -> StreamResult<()> {
        (**self).send(address, payload)
    }

    fn reconfigure(&mut self, osc: &OscConfig) -> StreamResult<()> {
        (**self).reconfigure(osc)
    }
}

/// Non-blocking UDP transport speaking OSC
#[derive(Debug)]
pub struct OscTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl OscTransport {
    /// Bind an ephemeral local socket aimed at `host:port`
    pub fn new(host: &str, port: u16) -> StreamResult<Self> {
        let target = resolve(host, port)?;
        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .map_err(|e| config_error!("cannot bind OSC socket: {}", e))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| config_error!("cannot make OSC socket non-blocking: {}", e))?;
        debug!(%target, "OSC transport ready");
        Ok(Self { socket, target })
    }

    /// Transport for the host and port in `osc`
    pub fn from_config(osc: &OscConfig) -> StreamResult<Self> {
        Self::new(&osc.address, osc.port)
    }

    /// Current receiver
    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

fn resolve(host: &str, port: u16) -> StreamResult<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| config_error!("cannot resolve OSC target {}:{}: {}", host, port, e))?
        .next()
        .ok_or_else(|| config_error!("OSC target {}:{} resolved to no address", host, port))
}

impl Transport for OscTransport {
    fn send(&mut self, address: &str, payload: &Payload) -> StreamResult<()> {
        let bytes = encode(address, payload)?;
        self.socket
            .send_to(&bytes, self.target)
            .map_err(|e| StreamError::transport(address, e.to_string()))?;
        Ok(())
    }

    fn reconfigure(&mut self, osc: &OscConfig) -> StreamResult<()> {
        let target = resolve(&osc.address, osc.port)?;
        if target != self.target {
            if target.is_ipv4() != self.target.is_ipv4() {
                *self = Self::new(&osc.address, osc.port)?;
            } else {
                self.target = target;
            }
            debug!(%target, "OSC target changed");
        }
        Ok(())
    }
}

/// One message ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// OSC address
    pub address: String,
    /// Source channel; `None` for bundled messages
    pub channel: Option<usize>,
    /// Value domain; `None` for bundled messages
    pub domain: Option<Domain>,
    /// Message body
    pub payload: Payload,
}

/// Delivery summary for one cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Messages handed to the transport
    pub attempted: usize,
    /// Messages the transport accepted
    pub delivered: usize,
    /// Per-message failures, in send order
    pub failures: Vec<StreamError>,
}

impl DispatchReport {
    /// Whether messages were attempted and none got through
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.delivered == 0
    }
}

/// Builds and sends each cycle's outbound messages
#[derive(Debug, Clone)]
pub struct Dispatcher {
    template: PathTemplate,
    mode: DispatchMode,
    bundle_address: String,
}

impl Dispatcher {
    /// Dispatcher for the given template and mode
    pub fn new(template: PathTemplate, mode: DispatchMode, bundle_address: impl Into<String>) -> Self {
        Self {
            template,
            mode,
            bundle_address: bundle_address.into(),
        }
    }

    /// Dispatcher described by an OSC configuration section
    pub fn from_config(osc: &OscConfig) -> StreamResult<Self> {
        osc.validate()?;
        Ok(Self::new(
            PathTemplate::parse(&osc.path_template)?,
            osc.mode,
            osc.bundle_address.clone(),
        ))
    }

    /// Packing mode
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Address template
    pub fn template(&self) -> &PathTemplate {
        &self.template
    }

    /// Messages for this cycle's outputs. Channels without a value (or
    /// without a spectrum) are skipped.
    pub fn plan(
        &self,
        selection: &ChannelSelection,
        filtered: &BTreeMap<usize, f64>,
        spectra: &BTreeMap<usize, &SpectralFrame>,
    ) -> Vec<OutboundMessage> {
        match self.mode {
            DispatchMode::PerChannel => self.plan_per_channel(selection, filtered, spectra),
            DispatchMode::Bundled => self.plan_bundled(selection, filtered, spectra),
        }
    }

    fn plan_per_channel(
        &self,
        selection: &ChannelSelection,
        filtered: &BTreeMap<usize, f64>,
        spectra: &BTreeMap<usize, &SpectralFrame>,
    ) -> Vec<OutboundMessage> {
        let channels = selection.outbound_time.union(&selection.outbound_fft);
        let mut messages = Vec::new();

        for &channel in channels {
            if selection.outbound_time.contains(&channel) {
                if let Some(&value) = filtered.get(&channel) {
                    messages.push(OutboundMessage {
                        address: self.template.render(channel, Domain::Time),
                        channel: Some(channel),
                        domain: Some(Domain::Time),
                        payload: Payload::Scalar(value as f32),
                    });
                }
            }
            if selection.outbound_fft.contains(&channel) {
                if let Some(frame) = spectra.get(&channel) {
                    messages.push(OutboundMessage {
                        address: self.template.render(channel, Domain::Fft),
                        channel: Some(channel),
                        domain: Some(Domain::Fft),
                        payload: Payload::spectrum(frame),
                    });
                }
            }
        }

        messages
    }

    fn plan_bundled(
        &self,
        selection: &ChannelSelection,
        filtered: &BTreeMap<usize, f64>,
        spectra: &BTreeMap<usize, &SpectralFrame>,
    ) -> Vec<OutboundMessage> {
        let scalars = selection
            .outbound_time
            .iter()
            .filter_map(|channel| filtered.get(channel))
            .map(|&value| value as f32);
        let magnitudes = selection
            .outbound_fft
            .iter()
            .filter_map(|channel| spectra.get(channel))
            .flat_map(|frame| frame.bins.iter().map(|bin| bin.magnitude as f32));
        let values: Vec<f32> = scalars.chain(magnitudes).collect();

        if values.is_empty() {
            return Vec::new();
        }
        vec![OutboundMessage {
            address: self.bundle_address.clone(),
            channel: None,
            domain: None,
            payload: Payload::Values(values),
        }]
    }

    /// Plan and send this cycle's messages through `transport`
    pub fn dispatch<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        selection: &ChannelSelection,
        filtered: &BTreeMap<usize, f64>,
        spectra: &BTreeMap<usize, &SpectralFrame>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        for message in self.plan(selection, filtered, spectra) {
            report.attempted += 1;
            match transport.send(&message.address, &message.payload) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(address = %message.address, error = %e, "OSC send failed");
                    report.failures.push(e);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brainosc_core::SpectralBin;
    use std::collections::BTreeSet;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(String, Payload)>,
        refuse: Option<String>,
    }

    impl Transport for Recorder {
        fn send(&mut self, address: &str, payload: &Payload) -> StreamResult<()> {
            if self.refuse.as_deref() == Some(address) {
                return Err(StreamError::transport(address, "refused"));
            }
            self.sent.push((address.to_string(), payload.clone()));
            Ok(())
        }
    }

    fn frame(channel: usize) -> SpectralFrame {
        SpectralFrame {
            channel,
            window_length: 4,
            sample_rate: 4.0,
            bins: vec![
                SpectralBin { frequency: 0.0, magnitude: 2.0 },
                SpectralBin { frequency: 1.0, magnitude: 0.5 },
                SpectralBin { frequency: 2.0, magnitude: 0.25 },
            ],
        }
    }

    fn selection(time: &[usize], fft: &[usize]) -> ChannelSelection {
        let time: BTreeSet<usize> = time.iter().copied().collect();
        let fft: BTreeSet<usize> = fft.iter().copied().collect();
        ChannelSelection {
            filtered: time.clone(),
            fft: fft.clone(),
            outbound_time: time,
            outbound_fft: fft,
        }
    }

    #[test]
    fn test_template_render() {
        let template = PathTemplate::parse("/eeg/ch{n}/{domain}").unwrap();
        assert_eq!(template.render(0, Domain::Time), "/eeg/ch0/time");
        assert_eq!(template.render(12, Domain::Fft), "/eeg/ch12/fft");
        assert_eq!(template.to_string(), "/eeg/ch{n}/{domain}");

        let prefixed = PathTemplate::parse("/{domain}/{n}").unwrap();
        assert_eq!(prefixed.render(3, Domain::Fft), "/fft/3");
    }

    #[test]
    fn test_template_rejects_bad_input() {
        assert!(PathTemplate::parse("eeg/{n}/{domain}").is_err());
        assert!(PathTemplate::parse("/eeg/{n}").is_err());
        assert!(PathTemplate::parse("/eeg/{domain}").is_err());
        assert!(PathTemplate::parse("/eeg/{n/{domain}").is_err());
        assert!(PathTemplate::parse("/eeg/{x}/{n}/{domain}").is_err());
        assert!(PathTemplate::parse("/eeg ch/{n}/{domain}").is_err());
        assert!(PathTemplate::parse("/eeg}/{n}/{domain}").is_err());
    }

    #[test]
    fn test_per_channel_order_interleaves_domains() {
        let dispatcher = Dispatcher::from_config(&OscConfig::default()).unwrap();
        let filtered: BTreeMap<usize, f64> = [(0, 1.0), (1, 2.0)].into_iter().collect();
        let frames = [frame(0), frame(1)];
        let spectra: BTreeMap<usize, &SpectralFrame> = frames.iter().map(|f| (f.channel, f)).collect();

        let addresses: Vec<String> = dispatcher
            .plan(&selection(&[0, 1], &[0, 1]), &filtered, &spectra)
            .into_iter()
            .map(|m| m.address)
            .collect();
        assert_eq!(
            addresses,
            vec!["/eeg/ch0/time", "/eeg/ch0/fft", "/eeg/ch1/time", "/eeg/ch1/fft"]
        );
    }

    #[test]
    fn test_spectrum_payload_is_flattened_pairs() {
        let args = Payload::spectrum(&frame(0)).to_osc_args();
        assert_eq!(
            args,
            vec![
                OscType::Float(0.0),
                OscType::Float(2.0),
                OscType::Float(1.0),
                OscType::Float(0.5),
                OscType::Float(2.0),
                OscType::Float(0.25),
            ]
        );
    }

    #[test]
    fn test_bundled_mode_single_message() {
        let mut osc = OscConfig::default();
        osc.mode = DispatchMode::Bundled;
        let dispatcher = Dispatcher::from_config(&osc).unwrap();

        let filtered: BTreeMap<usize, f64> = [(0, 1.0), (2, 3.0)].into_iter().collect();
        let frames = [frame(2)];
        let spectra: BTreeMap<usize, &SpectralFrame> = frames.iter().map(|f| (f.channel, f)).collect();

        let messages = dispatcher.plan(&selection(&[0, 2], &[2]), &filtered, &spectra);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].address, "/wek/inputs");
        assert_eq!(messages[0].payload, Payload::Values(vec![1.0, 3.0, 2.0, 0.5, 0.25]));

        assert!(dispatcher
            .plan(&selection(&[0], &[]), &BTreeMap::new(), &BTreeMap::new())
            .is_empty());
    }

    #[test]
    fn test_failure_does_not_stop_batch() {
        let dispatcher = Dispatcher::from_config(&OscConfig::default()).unwrap();
        let filtered: BTreeMap<usize, f64> = (0..4).map(|c| (c, c as f64)).collect();
        let mut transport = Recorder {
            refuse: Some("/eeg/ch1/time".to_string()),
            ..Default::default()
        };

        let report = dispatcher.dispatch(
            &mut transport,
            &selection(&[0, 1, 2, 3], &[]),
            &filtered,
            &BTreeMap::new(),
        );
        assert_eq!(report.attempted, 4);
        assert_eq!(report.delivered, 3);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.all_failed());
        assert_eq!(transport.sent.len(), 3);
        assert_eq!(transport.sent[2].0, "/eeg/ch3/time");
    }

    #[test]
    fn test_encode_decodes_back() {
        let bytes = encode("/eeg/ch2/time", &Payload::Scalar(1.5)).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&bytes).unwrap();
        match packet {
            OscPacket::Message(message) => {
                assert_eq!(message.addr, "/eeg/ch2/time");
                assert_eq!(message.args, vec![OscType::Float(1.5)]);
            }
            other => panic!("unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_udp_transport_delivers() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = receiver.local_addr().unwrap().port();

        let mut transport = OscTransport::new("127.0.0.1", port).unwrap();
        transport.send("/eeg/ch0/time", &Payload::Scalar(4.0)).unwrap();

        let mut buffer = [0u8; 1024];
        let (len, _) = receiver.recv_from(&mut buffer).unwrap();
        let (_, packet) = rosc::decoder::decode_udp(&buffer[..len]).unwrap();
        assert!(matches!(packet, OscPacket::Message(ref m) if m.addr == "/eeg/ch0/time"));
    }
}
