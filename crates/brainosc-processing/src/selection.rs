//! Channel routing: which channels feed filtering, the spectral transform,
//! and outbound messages.
//!
//! The outbound expression follows the device naming users see on screen:
//! `*` routes everything that is computed, otherwise a whitespace-separated
//! list of 1-based names such as `chan1 chan3 fft_chan3`.

use brainosc_core::{config_error, StreamResult};
use serde::Serialize;
use std::collections::BTreeSet;

/// Resolved channel routing for one configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelSelection {
    /// Channels run through the filter bank
    pub filtered: BTreeSet<usize>,
    /// Channels run through the spectral transform
    pub fft: BTreeSet<usize>,
    /// Channels sent as time-domain scalars
    pub outbound_time: BTreeSet<usize>,
    /// Channels sent as spectra
    pub outbound_fft: BTreeSet<usize>,
}

/// One parsed token of an outbound channel expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutboundToken {
    All,
    Time(usize),
    Fft(usize),
}

impl ChannelSelection {
    /// Filter, transform and send every channel in `0..channel_count`
    pub fn all(channel_count: usize) -> Self {
        let every: BTreeSet<usize> = (0..channel_count).collect();
        Self {
            filtered: every.clone(),
            fft: every.clone(),
            outbound_time: every.clone(),
            outbound_fft: every,
        }
    }

    /// Resolve routing from configured sets and an outbound expression.
    ///
    /// `fft` defaults to `selected`. With the transform disabled no spectra
    /// are computed or sent, whatever the expression names.
    pub fn resolve(
        channel_count: usize,
        selected: &BTreeSet<usize>,
        fft: Option<&BTreeSet<usize>>,
        outbound: &str,
        fft_enabled: bool,
    ) -> StreamResult<Self> {
        check_range("channels.selected", selected, channel_count)?;
        let fft = match fft {
            Some(set) => {
                check_range("channels.fft", set, channel_count)?;
                set.clone()
            }
            None => selected.clone(),
        };
        let fft = if fft_enabled { fft } else { BTreeSet::new() };

        let mut selection = ChannelSelection {
            filtered: selected.clone(),
            fft,
            ..Default::default()
        };

        for token in parse_outbound(outbound, channel_count)? {
            match token {
                OutboundToken::All => {
                    selection.outbound_time.extend(selection.filtered.iter().copied());
                    selection.outbound_fft.extend(selection.fft.iter().copied());
                }
                OutboundToken::Time(channel) => {
                    selection.outbound_time.insert(channel);
                }
                OutboundToken::Fft(channel) => {
                    if selection.fft.contains(&channel) {
                        selection.outbound_fft.insert(channel);
                    }
                }
            }
        }

        Ok(selection)
    }

    /// Channels the resampler must produce: everything that is filtered,
    /// transformed or sent
    pub fn resampled(&self) -> BTreeSet<usize> {
        self.filtered
            .iter()
            .chain(&self.fft)
            .chain(&self.outbound_time)
            .chain(&self.outbound_fft)
            .copied()
            .collect()
    }

    /// Whether nothing is routed anywhere
    pub fn is_empty(&self) -> bool {
        self.resampled().is_empty()
    }
}

fn check_range(name: &str, channels: &BTreeSet<usize>, channel_count: usize) -> StreamResult<()> {
    match channels.iter().find(|&&c| c >= channel_count) {
        Some(channel) => Err(config_error!(
            "{} names channel {} but only {} channels are configured",
            name,
            channel,
            channel_count
        )),
        None => Ok(()),
    }
}

fn parse_outbound(expression: &str, channel_count: usize) -> StreamResult<Vec<OutboundToken>> {
    expression
        .split_whitespace()
        .map(|token| parse_token(token, channel_count))
        .collect()
}

fn parse_token(token: &str, channel_count: usize) -> StreamResult<OutboundToken> {
    if token == "*" {
        return Ok(OutboundToken::All);
    }

    let (number, fft) = if let Some(rest) = token.strip_prefix("fft_chan") {
        (rest, true)
    } else if let Some(rest) = token.strip_prefix("chan") {
        (rest, false)
    } else {
        return Err(config_error!(
            "unknown outbound channel '{}', expected '*', 'chanN' or 'fft_chanN'",
            token
        ));
    };

    let ordinal: usize = number
        .parse()
        .map_err(|_| config_error!("invalid channel number in '{}'", token))?;
    if ordinal == 0 || ordinal > channel_count {
        return Err(config_error!(
            "'{}' is outside chan1..chan{}",
            token,
            channel_count
        ));
    }

    let channel = ordinal - 1;
    Ok(if fft {
        OutboundToken::Fft(channel)
    } else {
        OutboundToken::Time(channel)
    })
}
