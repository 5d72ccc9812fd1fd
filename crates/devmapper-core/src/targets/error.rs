use crate::io::IoRequest;
use crate::table::TableDevices;
use crate::target::{MapOutcome, Target, TargetType};
use devmapper_common::Sector;

/// Target type that fails every request, used to punch holes in a device
#[derive(Debug, Default)]
pub struct ErrorType;

impl TargetType for ErrorType {
    fn name(&self) -> &str {
        "error"
    }

    fn construct(
        &self,
        _devices: &mut TableDevices,
        _start: Sector,
        _length: Sector,
        _args: &[String],
    ) -> Result<Box<dyn Target>, String> {
        Ok(Box::new(ErrorTarget))
    }
}

struct ErrorTarget;

impl Target for ErrorTarget {
    fn map(&self, request: &mut IoRequest) -> MapOutcome {
        MapOutcome::Rejected(format!(
            "{} to error target at sector {}",
            request.direction, request.sector
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_every_request() {
        let mut devices = TableDevices::new();
        let target = ErrorType.construct(&mut devices, 100, 100, &[]).unwrap();

        let mut request = IoRequest::read(150, 1);
        assert!(matches!(target.map(&mut request), MapOutcome::Rejected(_)));
        assert!(devices.is_empty());
        assert_eq!(target.describe(), "");
    }
}
