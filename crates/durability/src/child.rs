//! WAL writer, child side.
//!
//! A plain blocking loop over the socketpair: decode a request, assign
//! consecutive LSNs, append every row to the current xlog file, run one
//! `fdatasync` for the whole batch, reply. The child owns the xlog files
//! completely — the parent never writes them — so a crash on either side
//! of the socket leaves at worst a torn tail that recovery truncates.
//!
//! Files rotate by row count: the finished file gets an eof marker and a
//! final sync, and the next file is created under an `.inprogress` name,
//! renamed into place only after its header is durable.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use tracing::{debug, info};

use tidelog_core::{Lsn, Scn, TagClass};

use crate::dir::LogDir;
use crate::error::Result;
use crate::format::{
    encode_eof_marker, encode_row_with_marker, run_crc_step, FileHeader, FileType, VERSION_12,
};
use crate::writer::{WalConfig, WalReply, WalRequest};

struct Xlog {
    file: File,
    rows: u64,
}

/// Serve the parent until its socket closes.
///
/// `last_lsn` seeds the LSN counter and `last_run_crc` continues the
/// rolling-checksum chain across writer restarts.
pub fn serve(
    mut stream: UnixStream,
    last_lsn: Lsn,
    last_run_crc: u32,
    config: &WalConfig,
) -> Result<()> {
    let dir = LogDir::wal(&config.dir);
    dir.ensure_exists()?;

    let mut lsn = last_lsn;
    let mut run_crc = last_run_crc;
    let mut current: Option<Xlog> = None;

    info!(lsn = lsn.0, dir = %config.dir.display(), "wal child serving");
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        let request = WalRequest::decode(&body)?;
        let row_count = request.rows.len() as u32;

        let xlog = match current.as_mut() {
            Some(xlog) => xlog,
            None => {
                current = Some(create_xlog(&dir, lsn.next())?);
                current.as_mut().expect("just created")
            }
        };

        let mut batch = Vec::new();
        let mut last_scn = Scn::ZERO;
        for mut row in request.rows {
            lsn = lsn.next();
            row.lsn = lsn;
            last_scn = row.scn;
            if row.tag.class() == Ok(TagClass::Wal) {
                run_crc = run_crc_step(run_crc, &row.data);
            }
            batch.extend_from_slice(&encode_row_with_marker(&row, VERSION_12));
            xlog.rows += 1;
        }

        // one write + one fdatasync per batch is the whole point of
        // packing rows upstream
        xlog.file.write_all(&batch)?;
        xlog.file.sync_data()?;

        let reply = WalReply {
            seq: request.seq,
            epoch: request.epoch,
            row_count,
            lsn,
            scn: last_scn,
            crc_hist: vec![(lsn, run_crc)],
        };
        stream.write_all(&reply.encode())?;

        if xlog.rows >= config.rows_per_file {
            finish_xlog(current.take().expect("rotation with open file"))?;
        }
    }

    if let Some(xlog) = current.take() {
        finish_xlog(xlog)?;
    }
    info!(lsn = lsn.0, "wal child exiting");
    Ok(())
}

fn create_xlog(dir: &LogDir, base: Lsn) -> Result<Xlog> {
    let tmp = dir.inprogress_filename(base);
    let final_path = dir.filename(base);

    let mut file = File::create(&tmp)?;
    FileHeader::new(FileType::Xlog, Vec::new()).write_to(&mut file)?;
    file.sync_data()?;
    std::fs::rename(&tmp, &final_path)?;
    dir.sync()?;
    debug!(path = %final_path.display(), "xlog created");
    Ok(Xlog { file, rows: 0 })
}

fn finish_xlog(mut xlog: Xlog) -> Result<()> {
    xlog.file.write_all(&encode_eof_marker(VERSION_12))?;
    xlog.file.sync_data()?;
    Ok(())
}
