use super::{arg, sector};
use crate::io::IoRequest;
use crate::table::TableDevices;
use crate::target::{MapOutcome, Target, TargetType};
use devmapper_common::{DeviceId, Sector};

/// Maps a contiguous range onto one underlying device
#[derive(Debug, Default)]
pub struct LinearType;

impl TargetType for LinearType {
    fn name(&self) -> &str {
        "linear"
    }

    /// `<device> <offset>`
    fn construct(
        &self,
        devices: &mut TableDevices,
        start: Sector,
        length: Sector,
        args: &[String],
    ) -> Result<Box<dyn Target>, String> {
        if args.len() != 2 {
            return Err(format!("expected <device> <offset>, got {} arguments", args.len()));
        }

        let device = arg(args, 0, "device path")?;
        let offset = sector(args, 1, "destination start")?;
        if offset.checked_add(length).is_none() {
            return Err(format!("destination range {offset}+{length} overflows"));
        }

        let device = devices.get(DeviceId::from(device));
        Ok(Box::new(Linear {
            device,
            start,
            offset,
        }))
    }
}

struct Linear {
    device: DeviceId,
    start: Sector,
    offset: Sector,
}

impl Target for Linear {
    fn map(&self, request: &mut IoRequest) -> MapOutcome {
        let sector = self.offset + (request.sector - self.start);
        request.remap(self.device.clone(), sector);
        MapOutcome::Remapped
    }

    fn destroy(self: Box<Self>, devices: &mut TableDevices) {
        devices.put(&self.device);
    }

    fn describe(&self) -> String {
        format!("{} {}", self.device, self.offset)
    }
}
