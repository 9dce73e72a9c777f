// Copyright 2015-2018 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Traffic shaping for DPI evasion.
//!
//! Every outgoing request is overlaid with browser-like headers, and
//! batched queries additionally carry EDNS0 padding (RFC 7830) plus a
//! cover-traffic watermark option. Shaping is best-effort: a query that
//! cannot be shaped is still sent.
//!
//! The two header policies are intentionally different per path: the
//! single-shot path blanks the `User-Agent` after the overlay
//! ([`HeaderPolicy::Anonymize`]), while the batched path keeps the
//! randomized browser one ([`HeaderPolicy::Camouflage`]).

use std::sync::Mutex;

use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::EdnsOption;
use http::header::{HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use http::HeaderMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::MIME_APPLICATION_DNS;

/// EDNS0 Padding option code (RFC 7830).
const PADDING_CODE: u16 = 12;

/// Wire overhead of one EDNS0 option: code and length, two octets each.
const OPTION_HEADER_LEN: usize = 4;

/// How outgoing HTTP headers are disguised.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeaderPolicy {
    /// Overlay browser headers, then blank the `User-Agent` so the request
    /// carries none.
    Anonymize,
    /// Overlay browser headers and keep the randomized `User-Agent`.
    Camouflage,
}

pub(crate) struct StealthShaper {
    rng: Mutex<StdRng>,
}

impl StealthShaper {
    pub(crate) fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Overlays the browser header set, then forces the DoH content
    /// negotiation and applies `policy` to the `User-Agent`.
    pub(crate) fn shape_headers(&self, headers: &mut HeaderMap, policy: HeaderPolicy) {
        let user_agent = match policy {
            HeaderPolicy::Anonymize => HeaderValue::from_static(""),
            HeaderPolicy::Camouflage => match HeaderValue::from_str(&self.browser_user_agent()) {
                Ok(value) => value,
                // best-effort: an unusable UA just stays absent
                Err(_) => return,
            },
        };

        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert(USER_AGENT, user_agent);

        // the final pass always wins content negotiation back for DoH
        headers.insert(ACCEPT, HeaderValue::from_static(MIME_APPLICATION_DNS));
    }

    /// A plausible recent Firefox-on-Windows `User-Agent`.
    pub(crate) fn browser_user_agent(&self) -> String {
        let mut rng = self.rng.lock().expect("shaper rng poisoned");
        let windows_major = 5 + rng.random_range(0..2u8);
        let windows_minor = rng.random_range(0..3u8);
        let gecko = 70 + rng.random_range(0..10u8);
        let firefox = 70 + rng.random_range(0..10u8);

        format!(
            "Mozilla/5.0 (Windows NT {windows_major}.{windows_minor}; rv:{gecko}.0) \
             Gecko/20100101 Firefox/{firefox}.0"
        )
    }

    /// Pads `message` with an RFC 7830 option so its wire form reaches a
    /// randomized target size. Failures are logged and swallowed.
    pub(crate) fn pad_message(&self, message: &mut Message) {
        let target = self.padding_target() as usize;

        ensure_edns(message);
        let current = match message.to_vec() {
            Ok(buf) => buf.len(),
            Err(err) => {
                debug!(error = %err, "skipping padding for unserializable message");
                return;
            }
        };

        // the option header itself counts toward the target
        if current + OPTION_HEADER_LEN >= target {
            return;
        }
        let pad_len = target - current - OPTION_HEADER_LEN;

        if let Some(edns) = message.extensions_mut() {
            edns.options_mut()
                .insert(EdnsOption::Unknown(PADDING_CODE, vec![0; pad_len]));
        }
    }

    /// A padding target in 128..192, quantized down to a multiple of 8.
    pub(crate) fn padding_target(&self) -> u16 {
        let mut rng = self.rng.lock().expect("shaper rng poisoned");
        let base: u16 = 128 + rng.random_range(0..64);
        base & !7
    }

    /// Appends the cover-traffic watermark option: a randomized local-use
    /// code with a `{0x00, random}` payload. Option codes are 16-bit, so
    /// the draw stays inside 65000..65535.
    pub(crate) fn watermark(&self, message: &mut Message) {
        let (code, tag) = {
            let mut rng = self.rng.lock().expect("shaper rng poisoned");
            (65000 + rng.random_range(0..535u16), rng.random::<u8>())
        };

        ensure_edns(message);
        if let Some(edns) = message.extensions_mut() {
            edns.options_mut()
                .insert(EdnsOption::Unknown(code, vec![0x00, tag]));
        }
    }
}

fn ensure_edns(message: &mut Message) {
    if message.extensions().is_none() {
        let mut edns = Edns::new();
        edns.set_version(0);
        *message.extensions_mut() = Some(edns);
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::opt::EdnsCode;
    use hickory_proto::rr::{Name, RecordType};

    use super::*;

    fn query(name: &str) -> Message {
        let mut message = Message::new();
        message.add_query(Query::query(
            Name::from_str(name).unwrap(),
            RecordType::A,
        ));
        message
    }

    #[test]
    fn test_padding_target_quantization() {
        let shaper = StealthShaper::new(Some(42));
        for _ in 0..1_000 {
            let target = shaper.padding_target();
            assert_eq!(target % 8, 0, "target {target} not quantized");
            assert!((128..192).contains(&target), "target {target} out of range");
        }
    }

    #[test]
    fn test_padding_reaches_target_size() {
        // seeded, so the target is reproducible across both calls
        let shaper = StealthShaper::new(Some(7));
        let target = StealthShaper::new(Some(7)).padding_target() as usize;

        let mut message = query("www.example.com.");
        shaper.pad_message(&mut message);

        let padded = message.to_vec().expect("pack failed");
        assert_eq!(padded.len(), target);
    }

    #[test]
    fn test_padding_skipped_when_already_large() {
        let shaper = StealthShaper::new(Some(42));
        let mut message = query(
            "a-rather-long-label.with-several-parts.and-more-of-them.padding-will-not-fit.\
             because-the-name-alone.exceeds-the-target.and-yet-another-label.\
             to-be-safely-oversized.example.com.",
        );
        let before = message.to_vec().unwrap().len();
        assert!(before > 192);

        shaper.pad_message(&mut message);
        let edns = message.extensions().as_ref().expect("edns added");
        assert!(edns.option(EdnsCode::Padding).is_none());
    }

    #[test]
    fn test_watermark_code_range() {
        let shaper = StealthShaper::new(Some(42));
        for _ in 0..100 {
            let mut message = query("www.example.com.");
            shaper.watermark(&mut message);

            let edns = message.extensions().as_ref().expect("edns added");
            let (code, option) = edns
                .options()
                .as_ref()
                .iter()
                .next()
                .expect("watermark option present");
            let code: u16 = (*code).into();
            // the draw is deliberately narrowed to what u16 can carry
            assert!((65000..65535).contains(&code), "code {code} out of range");

            let data: Vec<u8> = match option {
                EdnsOption::Unknown(_, data) => data.clone(),
                other => panic!("unexpected option {other:?}"),
            };
            assert_eq!(data.len(), 2);
            assert_eq!(data[0], 0x00);
        }
    }

    #[test]
    fn test_header_policies_differ_on_user_agent() {
        let shaper = StealthShaper::new(Some(42));

        let mut anonymized = HeaderMap::new();
        shaper.shape_headers(&mut anonymized, HeaderPolicy::Anonymize);
        assert_eq!(anonymized.get(USER_AGENT).unwrap(), "");

        let mut camouflaged = HeaderMap::new();
        shaper.shape_headers(&mut camouflaged, HeaderPolicy::Camouflage);
        let ua = camouflaged.get(USER_AGENT).unwrap().to_str().unwrap();
        assert!(ua.contains("Firefox"), "unexpected user agent {ua}");

        for headers in [&anonymized, &camouflaged] {
            assert_eq!(headers.get(ACCEPT).unwrap(), MIME_APPLICATION_DNS);
            assert_eq!(headers.get(ACCEPT_LANGUAGE).unwrap(), "en-US,en;q=0.5");
        }
    }
}
