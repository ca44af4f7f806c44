use crate::devices::DeviceLine;

/// Parses `lsusb` output.
///
/// Lines look like `Bus 001 Device 004: ID 1809:4750 Advantech`; the unit is
/// identified by `BUS:DEVICE`.  Lines in any other shape fall back to their
/// 1-based position in the listing.
#[cfg(any(unix, test))]
pub fn parse_lsusb(output: &str) -> Vec<DeviceLine> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| {
            let id = bus_address(line).unwrap_or_else(|| (i + 1).to_string());
            DeviceLine::new(id, line)
        })
        .collect()
}

#[cfg(any(unix, test))]
fn bus_address(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace();
    if tokens.next()? != "Bus" {
        return None;
    }
    let bus = tokens.next()?;
    if tokens.next()? != "Device" {
        return None;
    }
    let device = tokens.next()?.trim_end_matches(':');
    Some(format!("{bus}:{device}"))
}

/// Parses `pnputil /enum-devices /connected` output.
///
/// Each device is a block of `Key: value` lines starting with `Instance ID:`.
/// The whole block is kept as match text so the vendor/product ids embedded
/// in the instance path are found.
#[cfg(any(windows, test))]
pub fn parse_pnputil(output: &str) -> Vec<DeviceLine> {
    let mut devices = Vec::new();
    let mut current: Option<(String, Vec<String>)> = None;

    for line in output.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Instance ID:") {
            if let Some((id, text)) = current.take() {
                devices.push(DeviceLine::new(id, text.join(" ")));
            }
            current = Some((value.trim().to_string(), vec![line.to_string()]));
        } else if line.is_empty() {
            if let Some((id, text)) = current.take() {
                devices.push(DeviceLine::new(id, text.join(" ")));
            }
        } else if let Some((_, text)) = current.as_mut() {
            text.push(line.to_string());
        }
    }
    if let Some((id, text)) = current {
        devices.push(DeviceLine::new(id, text.join(" ")));
    }
    devices
}
