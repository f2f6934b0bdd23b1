use crate::capture::device::{DeviceDescriptor, Resolution};
use crate::capture::frame::Frame;
use crate::capture::pool::BufferPool;
use crate::error::Result;

/// Boolean capture-authorization check consulted before any enumeration.
pub trait PermissionGate: Send + Sync {
    fn is_granted(&self) -> bool;
}

impl<F> PermissionGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_granted(&self) -> bool {
        self()
    }
}

impl PermissionGate for bool {
    fn is_granted(&self) -> bool {
        *self
    }
}

/// Platform capture stack (V4L2, a synthetic pattern, a test script...).
///
/// Every method is called from the capture thread of the session that needs
/// it, never from the render thread.
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    /// List the capture devices currently present.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Acquire exclusive access to `device`.
    fn open_device(&self, device: &DeviceDescriptor) -> Result<Box<dyn CaptureDevice>>;
}

/// An opened capture device.
pub trait CaptureDevice: Send {
    fn id(&self) -> &str;

    /// Configure a capture session producing `resolution` frames whose
    /// buffers come from `pool`.
    fn create_session(
        &mut self,
        resolution: Resolution,
        pool: BufferPool,
    ) -> Result<Box<dyn CaptureSession>>;

    fn close(&mut self) -> Result<()>;
}

/// A configured association between a device and its frame output.
pub trait CaptureSession: Send {
    /// Begin the repeating capture request.
    fn start_repeating(&mut self) -> Result<()>;

    fn stop_repeating(&mut self) -> Result<()>;

    /// Wait a bounded time for the next completed capture.
    ///
    /// `Ok(None)` means nothing completed within the backend's poll interval.
    /// An error means the device is gone and the session cannot continue.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_act_as_permission_gates() {
        let granted = || true;
        let denied = || false;
        assert!(granted.is_granted());
        assert!(!denied.is_granted());
        assert!(true.is_granted());
        assert!(!false.is_granted());
    }

    #[test]
    fn trait_objects_are_send_sync() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        fn assert_send<T: Send + ?Sized>() {}
        assert_send_sync::<dyn CaptureBackend>();
        assert_send_sync::<dyn PermissionGate>();
        assert_send::<dyn CaptureDevice>();
        assert_send::<dyn CaptureSession>();
    }
}
