//! Debug API event processing
//!
//! Events come from two places: the target's own queue, polled with
//! `next_event`, and a channel that a notification callback running on
//! another thread can push into. Both are drained on the controlling thread;
//! the callback never touches the session directly.

use crate::error::Result;
use crate::session::DebugSession;
use crate::target::DebugTarget;
use crate::types::Event;
use std::sync::mpsc::Sender;

impl<A: DebugTarget> DebugSession<A> {
    /// Sender for out-of-band notifications.
    pub fn notifier(&self) -> Sender<Event> {
        self.notify_tx.clone()
    }

    /// Handle every queued event. Returns how many were handled.
    pub fn process_events(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(event) = self.notify_rx.try_recv() {
            self.process_event(event)?;
            handled += 1;
        }
        while let Some(event) = self.api.next_event()? {
            self.process_event(event)?;
            handled += 1;
        }
        Ok(handled)
    }

    fn process_event(&mut self, event: Event) -> Result<()> {
        common::log!(self.logs.session, "event {:?}", event);
        match event {
            Event::ContextCreate { dev, context } => {
                self.contexts.insert(context, dev);
            }
            Event::ContextDestroy { context, .. } => {
                self.contexts.remove(&context);
                let modules: Vec<u64> = self
                    .modules
                    .iter()
                    .filter(|(_, &ctx)| ctx == context)
                    .map(|(&module, _)| module)
                    .collect();
                for module in modules {
                    self.modules.remove(&module);
                    self.terminate_module(module);
                }
            }
            Event::ModuleLoad { context, module, .. } => {
                self.modules.insert(module, context);
            }
            Event::ModuleUnload { module, .. } => {
                self.modules.remove(&module);
                self.terminate_module(module);
            }
            Event::GridLaunch { dev, grid_id } => {
                let info = self.api.grid_info(dev, grid_id)?;
                self.start_kernel(info)?;
            }
            Event::GridTerminated { dev, grid_id } => {
                if let Some(id) = self.kernels.find_by_grid(dev, grid_id).map(|k| k.id) {
                    if let Some(kernel) = self.kernels.find_by_id_mut(id) {
                        kernel.invalidate();
                    }
                }
                self.update_terminated()?;
            }
            Event::DeviceException { dev } => {
                self.device_invalidate(dev);
            }
            Event::Timeout => {}
        }
        Ok(())
    }

    /// Context ids currently alive on `dev`.
    pub fn contexts(&self, dev: u32) -> Vec<u64> {
        self.contexts
            .iter()
            .filter(|(_, &d)| d == dev)
            .map(|(&ctx, _)| ctx)
            .collect()
    }

    pub fn module_is_loaded(&self, module: u64) -> bool {
        self.modules.contains_key(&module)
    }
}
