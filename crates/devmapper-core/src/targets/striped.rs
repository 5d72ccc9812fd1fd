use super::{arg, number, sector};
use crate::io::IoRequest;
use crate::table::TableDevices;
use crate::target::{MapOutcome, Target, TargetType};
use devmapper_common::{DeviceId, Sector};

use std::fmt::Write;

/// Stripes a range across devices in fixed-size chunks
#[derive(Debug, Default)]
pub struct StripedType;

impl TargetType for StripedType {
    fn name(&self) -> &str {
        "striped"
    }

    /// `<stripes> <chunk_sectors> (<device> <offset>){stripes}`
    fn construct(
        &self,
        devices: &mut TableDevices,
        start: Sector,
        length: Sector,
        args: &[String],
    ) -> Result<Box<dyn Target>, String> {
        let stripes: u32 = number(args, 0, "stripe count")?;
        let chunk_sectors: Sector = number(args, 1, "chunk size")?;

        if stripes == 0 {
            return Err("stripe count must be at least 1".to_string());
        }
        if !chunk_sectors.is_power_of_two() {
            return Err(format!("invalid chunk size {chunk_sectors}: not a power of two"));
        }
        if length % Sector::from(stripes) != 0 {
            return Err("target length is not divisible by the number of stripes".to_string());
        }

        let expected = 2 + 2 * stripes as usize;
        if args.len() != expected {
            return Err(format!(
                "expected {expected} arguments for {stripes} stripes, got {}",
                args.len()
            ));
        }

        // sectors each stripe spans, counting a trailing partial row of chunks
        let span = chunk_sectors
            .checked_mul(Sector::from(stripes))
            .and_then(|row| length.div_ceil(row).checked_mul(chunk_sectors))
            .ok_or_else(|| "stripe geometry overflows the sector space".to_string())?;

        // parse everything before touching the device list
        let mut destinations = Vec::with_capacity(stripes as usize);
        for i in 0..stripes as usize {
            let device = arg(args, 2 + 2 * i, "stripe device")?;
            let offset = sector(args, 3 + 2 * i, "stripe offset")?;
            if offset.checked_add(span).is_none() {
                return Err(format!(
                    "stripe {i}: offset {offset} + {span} sectors overflows the device"
                ));
            }
            destinations.push((DeviceId::from(device), offset));
        }

        let stripes = destinations
            .into_iter()
            .map(|(device, offset)| Stripe {
                device: devices.get(device),
                offset,
            })
            .collect();

        Ok(Box::new(Striped {
            start,
            chunk_shift: chunk_sectors.trailing_zeros(),
            chunk_mask: chunk_sectors - 1,
            stripes,
        }))
    }
}

struct Stripe {
    device: DeviceId,
    offset: Sector,
}

struct Striped {
    start: Sector,
    chunk_shift: u32,
    chunk_mask: Sector,
    stripes: Vec<Stripe>,
}

impl Target for Striped {
    fn map(&self, request: &mut IoRequest) -> MapOutcome {
        let offset = request.sector - self.start;
        let chunk = offset >> self.chunk_shift;
        let count = self.stripes.len() as Sector;

        let stripe = &self.stripes[(chunk % count) as usize];
        let sector =
            stripe.offset + ((chunk / count) << self.chunk_shift) + (offset & self.chunk_mask);

        request.remap(stripe.device.clone(), sector);
        MapOutcome::Remapped
    }

    fn destroy(self: Box<Self>, devices: &mut TableDevices) {
        for stripe in &self.stripes {
            devices.put(&stripe.device);
        }
    }

    fn describe(&self) -> String {
        let mut out = format!("{} {}", self.stripes.len(), self.chunk_mask + 1);
        for stripe in &self.stripes {
            let _ = write!(out, " {} {}", stripe.device, stripe.offset);
        }
        out
    }
}
