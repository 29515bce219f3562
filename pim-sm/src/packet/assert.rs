//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pim_utils::ip::AddressFamily;
use serde::{Deserialize, Serialize};

use crate::consts::{ASSERT_CANCEL_METRIC, ASSERT_CANCEL_METRIC_PREFERENCE};
use crate::packet::error::DecodeResult;
use crate::packet::{
    EncodedGroup, decode_group_addr, decode_unicast_addr, encode_group_addr,
    encode_unicast_addr,
};

const ASSERT_RPT_BIT: u32 = 0x8000_0000;

// PIM Assert message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AssertMsg {
    pub group: EncodedGroup,
    pub source: IpAddr,
    pub rpt_bit: bool,
    pub metric_preference: u32,
    pub metric: u32,
}

// An assert metric, as compared by the Assert state machines.
//
// The address breaks ties and identifies the assert winner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AssertMetric {
    pub rpt_bit: bool,
    pub metric_preference: u32,
    pub metric: u32,
    pub addr: IpAddr,
}

// ===== impl AssertMsg =====

impl AssertMsg {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        encode_group_addr(buf, &self.group);
        encode_unicast_addr(buf, &self.source);
        let mut preference = self.metric_preference & !ASSERT_RPT_BIT;
        if self.rpt_bit {
            preference |= ASSERT_RPT_BIT;
        }
        buf.put_u32(preference);
        buf.put_u32(self.metric);
    }

    pub(crate) fn decode(
        af: AddressFamily,
        buf: &mut Bytes,
    ) -> DecodeResult<AssertMsg> {
        let group = decode_group_addr(af, buf)?;
        let source = decode_unicast_addr(af, buf)?;
        let preference = buf.try_get_u32()?;
        let metric = buf.try_get_u32()?;
        Ok(AssertMsg {
            group,
            source,
            rpt_bit: preference & ASSERT_RPT_BIT != 0,
            metric_preference: preference & !ASSERT_RPT_BIT,
            metric,
        })
    }

    pub fn metric(&self, addr: IpAddr) -> AssertMetric {
        AssertMetric {
            rpt_bit: self.rpt_bit,
            metric_preference: self.metric_preference,
            metric: self.metric,
            addr,
        }
    }
}

// ===== impl AssertMetric =====

impl AssertMetric {
    pub fn new(
        rpt_bit: bool,
        metric_preference: u32,
        metric: u32,
        addr: IpAddr,
    ) -> AssertMetric {
        AssertMetric {
            rpt_bit,
            metric_preference,
            metric,
            addr,
        }
    }

    // The metric carried by an AssertCancel, worse than any real metric.
    pub fn infinite(addr: IpAddr) -> AssertMetric {
        AssertMetric {
            rpt_bit: true,
            metric_preference: ASSERT_CANCEL_METRIC_PREFERENCE,
            metric: ASSERT_CANCEL_METRIC,
            addr,
        }
    }

    pub fn is_assert_cancel(&self) -> bool {
        self.metric_preference == ASSERT_CANCEL_METRIC_PREFERENCE
            && self.metric == ASSERT_CANCEL_METRIC
    }

    // True if this metric wins over `other`.
    //
    // An RPT-bit metric always loses to a non-RPT one; then lower
    // preference wins, then lower metric, then higher address.
    pub fn is_better(&self, other: &AssertMetric) -> bool {
        if self.rpt_bit != other.rpt_bit {
            return !self.rpt_bit;
        }
        if self.metric_preference != other.metric_preference {
            return self.metric_preference < other.metric_preference;
        }
        if self.metric != other.metric {
            return self.metric < other.metric;
        }
        self.addr > other.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_comparison() {
        let a = AssertMetric::new(false, 100, 10, "10.0.0.1".parse().unwrap());
        let b = AssertMetric::new(false, 110, 5, "10.0.0.2".parse().unwrap());
        // Lower preference wins regardless of metric.
        assert!(a.is_better(&b));

        let c = AssertMetric::new(false, 100, 5, "10.0.0.2".parse().unwrap());
        // Equal preference, lower metric wins.
        assert!(c.is_better(&a));

        let d = AssertMetric::new(false, 100, 10, "10.0.0.9".parse().unwrap());
        // Full tie, higher address wins.
        assert!(d.is_better(&a));

        // The RPT bit is worse than any non-RPT metric.
        let rpt = AssertMetric::new(true, 1, 1, "10.0.0.9".parse().unwrap());
        assert!(a.is_better(&rpt));
        assert!(!rpt.is_better(&a));

        // AssertCancel loses to everything.
        let cancel = AssertMetric::infinite("10.0.0.1".parse().unwrap());
        assert!(cancel.is_assert_cancel());
        assert!(rpt.is_better(&cancel));
    }
}
