// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Stylings: the per-layer paint commands a render reads.
//!
//! A styling is a dword arena written on the host. Sealing uploads it, and it
//! follows the same seal and lock protocol as a composition.

use crate::arena::Key;
use crate::backend::Status;
use crate::device::Device;
use crate::grid::GridId;
use crate::recording::{BufferProxy, Recording};
use crate::seal::SealState;
use crate::task::Task;
use crate::{Error, Result};

/// A styling created by [`Context::styling_create`](crate::Context::styling_create).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Styling(pub(crate) Key);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StylingInfo {
    pub state: SealState,
    pub refs: u32,
    pub locks: u32,
    /// Dwords allocated so far.
    pub dwords: u32,
    pub capacity: u32,
}

pub(crate) struct StylingImpl {
    state: SealState,
    user_refs: u32,
    refs: u32,
    locks: u32,
    data: Vec<u32>,
    capacity: u32,
    pub(crate) buffer: BufferProxy,
    /// The upload started by the last seal, until it completes.
    pub(crate) seal_node: Option<GridId>,
    failed: Option<&'static str>,
}

pub(crate) fn record_seal(buffer: BufferProxy, data: &[u32]) -> Recording {
    let mut recording = Recording::new("styling");
    recording.upload(buffer, bytemuck::cast_slice::<_, u8>(data));
    recording
}

impl Device {
    pub(crate) fn styling_create(&mut self, dwords: u32) -> Result<Styling> {
        if dwords == 0 || dwords > self.config.styling.max_dwords {
            return Err(Error::InvalidArgs("styling size out of range"));
        }
        let key = self.stylings.insert(StylingImpl {
            state: SealState::Unsealed,
            user_refs: 1,
            refs: 1,
            locks: 0,
            data: Vec::with_capacity(dwords as usize),
            capacity: dwords,
            buffer: BufferProxy::new(u64::from(dwords) * 4, "styling"),
            seal_node: None,
            failed: None,
        });
        log::debug!("styling {key:?}: created with {dwords} dwords");
        Ok(Styling(key))
    }

    fn live_styling(&self, styling: Styling) -> Result<Key> {
        match self.stylings.get(styling.0) {
            Some(target) if target.user_refs > 0 => Ok(styling.0),
            _ => Err(Error::InvalidArgs("styling is not live")),
        }
    }

    fn styling_state(&self, key: Key) -> Option<SealState> {
        self.stylings.get(key).map(|target| target.state)
    }

    fn unsealed_styling(&mut self, styling: Styling) -> Result<&mut StylingImpl> {
        let key = self.live_styling(styling)?;
        match self.stylings.get_mut(key) {
            Some(target) if target.state == SealState::Unsealed => Ok(target),
            _ => Err(Error::StylingSealed),
        }
    }

    /// Allocates `dwords` zeroed dwords, returning their offset.
    pub(crate) fn styling_alloc(&mut self, styling: Styling, dwords: u32) -> Result<u32> {
        let target = self.unsealed_styling(styling)?;
        let used = target.data.len() as u32;
        let available = target.capacity - used;
        if dwords > available {
            return Err(Error::StylingOverflow {
                requested: dwords,
                available,
            });
        }
        target.data.resize((used + dwords) as usize, 0);
        Ok(used)
    }

    pub(crate) fn styling_write(
        &mut self,
        styling: Styling,
        offset: u32,
        data: &[u32],
    ) -> Result<()> {
        let target = self.unsealed_styling(styling)?;
        let start = offset as usize;
        let Some(dst) = target.data.get_mut(start..start + data.len()) else {
            return Err(Error::InvalidArgs("styling write outside of allocation"));
        };
        dst.copy_from_slice(data);
        Ok(())
    }

    pub(crate) fn styling_seal(&mut self, styling: Styling) -> Result<()> {
        let key = self.live_styling(styling)?;
        match self.styling_state(key) {
            Some(SealState::Sealing | SealState::Sealed) | None => return Ok(()),
            Some(SealState::Unsealing) => {
                self.wait_while("styling unseal", |device| {
                    device.styling_state(key) == Some(SealState::Unsealing)
                })?;
            }
            Some(SealState::Unsealed) => {}
        }
        let data = match self.stylings.get(key) {
            Some(target) => target.data.clone(),
            None => return Ok(()),
        };
        let node = self.attach(Task::StylingSeal { styling: key, data }, &[]);
        if let Some(target) = self.stylings.get_mut(key) {
            target.state = SealState::Sealing;
            target.seal_node = Some(node);
            target.refs += 1;
        }
        self.grid.force(node);
        log::debug!("styling {key:?}: sealing");
        Ok(())
    }

    pub(crate) fn styling_unseal(&mut self, styling: Styling, block: bool) -> Result<()> {
        let key = self.live_styling(styling)?;
        if self.styling_state(key) != Some(SealState::Unsealed) {
            if let Some(target) = self.stylings.get_mut(key) {
                target.state = SealState::Unsealing;
            }
            self.maybe_finish_styling_unseal(key);
            if block {
                self.wait_while("styling unseal", |device| {
                    device.styling_state(key) == Some(SealState::Unsealing)
                })?;
            }
        }
        match self.stylings.get_mut(key).and_then(|target| target.failed.take()) {
            Some(what) => Err(Error::DispatchFailed(what)),
            None => Ok(()),
        }
    }

    /// Unseals a styling and discards its contents.
    ///
    /// A failed seal is reported after the contents are discarded.
    pub(crate) fn styling_reset(&mut self, styling: Styling) -> Result<()> {
        let result = self.styling_unseal(styling, true);
        if let Some(target) = self.stylings.get_mut(styling.0) {
            if target.state == SealState::Unsealed {
                target.data.clear();
            }
        }
        result
    }

    fn maybe_finish_styling_unseal(&mut self, key: Key) {
        if let Some(target) = self.stylings.get_mut(key) {
            if target.state == SealState::Unsealing
                && target.seal_node.is_none()
                && target.locks == 0
            {
                target.state = SealState::Unsealed;
                log::debug!("styling {key:?}: unsealed");
            }
        }
    }

    pub(crate) fn styling_retain(&mut self, styling: Styling) -> Result<()> {
        let key = self.live_styling(styling)?;
        if let Some(target) = self.stylings.get_mut(key) {
            target.user_refs += 1;
            target.refs += 1;
        }
        Ok(())
    }

    pub(crate) fn styling_release(&mut self, styling: Styling) -> Result<()> {
        let key = self.live_styling(styling)?;
        if let Some(target) = self.stylings.get_mut(key) {
            target.user_refs -= 1;
        }
        self.release_styling_ref(key);
        Ok(())
    }

    fn release_styling_ref(&mut self, key: Key) {
        let Some(target) = self.stylings.get_mut(key) else {
            return;
        };
        target.refs -= 1;
        if target.refs == 0 {
            self.stylings.remove(key);
            log::debug!("styling {key:?}: destroyed");
        }
    }

    pub(crate) fn styling_lock(&mut self, key: Key) {
        if let Some(target) = self.stylings.get_mut(key) {
            target.refs += 1;
            target.locks += 1;
        }
    }

    pub(crate) fn styling_unlock(&mut self, key: Key) {
        if let Some(target) = self.stylings.get_mut(key) {
            target.locks -= 1;
        }
        self.maybe_finish_styling_unseal(key);
        self.release_styling_ref(key);
    }

    pub(crate) fn styling_retain_and_lock(&mut self, styling: Styling) -> Result<()> {
        let key = self.live_styling(styling)?;
        self.styling_lock(key);
        Ok(())
    }

    pub(crate) fn styling_unlock_and_release(&mut self, styling: Styling) -> Result<()> {
        match self.stylings.get(styling.0) {
            Some(target) if target.locks > 0 => {
                self.styling_unlock(styling.0);
                Ok(())
            }
            _ => Err(Error::InvalidArgs("styling is not locked")),
        }
    }

    pub(crate) fn styling_info(&self, styling: Styling) -> Result<StylingInfo> {
        let key = self.live_styling(styling)?;
        let target = self
            .stylings
            .get(key)
            .ok_or(Error::InvalidArgs("styling is not live"))?;
        Ok(StylingInfo {
            state: target.state,
            refs: target.user_refs,
            locks: target.locks,
            dwords: target.data.len() as u32,
            capacity: target.capacity,
        })
    }

    pub(crate) fn styling_failed(&mut self, key: Key, what: &'static str) {
        if let Some(target) = self.stylings.get_mut(key) {
            target.failed.get_or_insert(what);
        }
    }

    pub(crate) fn styling_seal_complete(&mut self, key: Key, status: Status) {
        let Some(target) = self.stylings.get_mut(key) else {
            return;
        };
        target.seal_node = None;
        if status.is_failure() {
            target.failed.get_or_insert("styling");
        }
        if target.state == SealState::Sealing {
            target.state = SealState::Sealed;
            log::debug!("styling {key:?}: sealed");
        } else {
            self.maybe_finish_styling_unseal(key);
        }
        self.release_styling_ref(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetConfig;
    use crate::headless::HeadlessBackend;

    fn device() -> Device {
        Device::new(TargetConfig::default(), Box::new(HeadlessBackend::new())).unwrap()
    }

    #[test]
    fn alloc_and_write() {
        let mut device = device();
        let styling = device.styling_create(8).unwrap();
        assert_eq!(device.styling_alloc(styling, 3).unwrap(), 0);
        assert_eq!(device.styling_alloc(styling, 2).unwrap(), 3);
        device.styling_write(styling, 3, &[7, 8]).unwrap();
        assert!(matches!(
            device.styling_write(styling, 4, &[1, 2]),
            Err(Error::InvalidArgs(_))
        ));
        assert_eq!(
            device.styling_alloc(styling, 4),
            Err(Error::StylingOverflow {
                requested: 4,
                available: 3
            })
        );
    }

    #[test]
    fn sealed_styling_rejects_writes() {
        let mut device = device();
        let styling = device.styling_create(8).unwrap();
        device.styling_alloc(styling, 1).unwrap();
        device.styling_seal(styling).unwrap();
        assert_eq!(device.styling_alloc(styling, 1), Err(Error::StylingSealed));
        assert_eq!(
            device.styling_write(styling, 0, &[1]),
            Err(Error::StylingSealed)
        );
        device.styling_reset(styling).unwrap();
        let info = device.styling_info(styling).unwrap();
        assert_eq!((info.state, info.dwords), (SealState::Unsealed, 0));
    }

    #[test]
    fn oversized_styling_is_rejected() {
        let mut device = device();
        let max = device.config.styling.max_dwords;
        assert!(device.styling_create(max + 1).is_err());
        assert!(device.styling_create(0).is_err());
    }
}
