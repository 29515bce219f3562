//
// Copyright (c) The pim-sm Contributors
//
// SPDX-License-Identifier: MIT
//

//! Requests toward the forwarder bridge.
//!
//! MFC installation and removal live with the task engine, which owns
//! the olist computation; this module carries the dataflow-monitor
//! operations.

use std::net::IpAddr;

use pim_utils::mfea::{DataflowMonitorMsg, MfcRequestMsg};

use crate::instance::Instance;

pub fn add_dataflow_monitor(
    instance: &mut Instance,
    monitor: DataflowMonitorMsg,
) {
    let Some((view, _)) = instance.as_up() else {
        return;
    };
    view.send_mfc(MfcRequestMsg::AddDataflowMonitor(monitor));
}

pub fn delete_dataflow_monitor(
    instance: &mut Instance,
    monitor: DataflowMonitorMsg,
) {
    let Some((view, _)) = instance.as_up() else {
        return;
    };
    view.send_mfc(MfcRequestMsg::DeleteDataflowMonitor(monitor));
}

pub fn delete_all_dataflow_monitor(
    instance: &mut Instance,
    source: IpAddr,
    group: IpAddr,
) {
    let Some((view, _)) = instance.as_up() else {
        return;
    };
    view.send_mfc(MfcRequestMsg::DeleteAllDataflowMonitor { source, group });
}
