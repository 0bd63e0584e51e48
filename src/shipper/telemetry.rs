//! Shipper telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use std::sync::OnceLock;

struct ShipperInstruments {
    dir_syncs: Counter<u64>,
    dir_sync_failures: Counter<u64>,
    uploads: Counter<u64>,
    upload_failures: Counter<u64>,
    corrupted_blocks: Counter<u64>,
}

fn instruments() -> &'static ShipperInstruments {
    static INSTRUMENTS: OnceLock<ShipperInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("flotilla.shipper");
        ShipperInstruments {
            dir_syncs: meter
                .u64_counter("flotilla.shipper.dir.syncs")
                .with_description("Total number of completed dir sync passes")
                .init(),
            dir_sync_failures: meter
                .u64_counter("flotilla.shipper.dir.sync_failures")
                .with_description("Total number of failed dir sync passes")
                .init(),
            uploads: meter
                .u64_counter("flotilla.shipper.uploads")
                .with_description("Total number of uploaded blocks")
                .init(),
            upload_failures: meter
                .u64_counter("flotilla.shipper.upload_failures")
                .with_description("Total number of block upload failures")
                .init(),
            corrupted_blocks: meter
                .u64_counter("flotilla.shipper.corrupted_blocks")
                .with_description("Total number of corrupted blocks encountered")
                .init(),
        }
    })
}

pub(crate) fn record_dir_sync(failed: bool) {
    if failed {
        instruments().dir_sync_failures.add(1, &[]);
    } else {
        instruments().dir_syncs.add(1, &[]);
    }
}

pub(crate) fn record_upload() {
    instruments().uploads.add(1, &[]);
}

pub(crate) fn record_upload_failures(count: u64) {
    if count > 0 {
        instruments().upload_failures.add(count, &[]);
    }
}

pub(crate) fn record_corrupted_blocks(count: u64) {
    if count > 0 {
        instruments().corrupted_blocks.add(count, &[]);
    }
}
