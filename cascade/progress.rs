/// Observer for reporting progress across bootstrap iterations.
///
/// Boots may finish out of order when they run on a thread pool, so the
/// observer is shared by reference and must be `Sync`.
pub trait BootProgressObserver: Sync {
    fn on_run_start(&self, total_boots: usize) {
        let _ = total_boots;
    }
    fn on_boot_finish(&self, boot: usize) {
        let _ = boot;
    }
    fn on_run_finish(&self) {}
}

#[derive(Default)]
pub struct NoopBootProgress;

impl BootProgressObserver for NoopBootProgress {}
