use crate::{DownloadError, Error, Result};
use crate::instrument::{ChannelId, Instruments};
use crate::sync::ReleasedGroup;
use crate::waveform::{AcquisitionEvent, InstrumentCapture};

/// Pulls every channel of every member of a released group into memory.
///
/// A failed channel is recorded on its capture and skipped; only running out of memory aborts
/// the download.
#[derive(Debug, Default)]
pub struct WaveformDownloader {
    downloaded: u64,
    failed: u64,
}

impl WaveformDownloader {
    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn download(&mut self, instruments: &mut Instruments, group: &ReleasedGroup)
            -> Result<AcquisitionEvent> {
        let mut captures = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let id = member.instrument;
            let mut capture = InstrumentCapture::new(id, member.trigger_time, member.skew_fs);
            let streams = instruments.streams(id).iter()
                .map(|stream| stream.index)
                .collect::<Vec<_>>();
            let Some(handle) = instruments.handle_mut(id) else {
                log::warn!("download: {:?} disconnected before download", id);
                captures.push(capture);
                continue
            };
            for stream in streams {
                match handle.download_waveform(stream) {
                    Ok(waveform) => {
                        log::trace!("download: {} stream {}: {} samples",
                            handle.name(), stream, waveform.len());
                        capture.insert(stream, waveform);
                        self.downloaded += 1;
                    }
                    Err(source @ DownloadError::OutOfMemory(_)) => {
                        log::error!("download: {} stream {}: {}", handle.name(), stream, source);
                        return Err(Error::ResourceExhausted {
                            channel: ChannelId::new(id, stream),
                            source,
                        })
                    }
                    Err(error) => {
                        log::warn!("download: {} stream {}: {}", handle.name(), stream, error);
                        capture.mark_failed(stream);
                        self.failed += 1;
                    }
                }
            }
            captures.push(capture);
        }
        Ok(AcquisitionEvent::new(group.trigger_time, captures, group.free_run))
    }
}
