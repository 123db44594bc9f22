use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Host, HostId};

fn get_host_from_id(host_id: HostId) -> Result<Host> {
    cpal::host_from_id(host_id).map_err(|e| anyhow::anyhow!("Failed to get audio host: {}", e))
}

/// Resolves a host by its name (case insensitive), or the default host.
pub fn host_id_from_name(name: Option<&str>) -> Result<HostId> {
    let Some(name) = name else {
        return Ok(cpal::default_host().id());
    };
    cpal::available_hosts()
        .into_iter()
        .find(|id| id.name().eq_ignore_ascii_case(name))
        .ok_or_else(|| anyhow::anyhow!("Audio host not available: {}", name))
}

pub fn get_input_devices(host_id: HostId) -> Result<Vec<String>> {
    let host = get_host_from_id(host_id)?;
    Ok(host.input_devices()?.filter_map(|d| d.name().ok()).collect())
}

pub fn get_output_devices(host_id: HostId) -> Result<Vec<String>> {
    let host = get_host_from_id(host_id)?;
    Ok(host.output_devices()?.filter_map(|d| d.name().ok()).collect())
}

/// Logs every host with its input and output devices.
pub fn log_devices() {
    for host_id in cpal::available_hosts() {
        log::info!("Host: {}", host_id.name());
        match get_input_devices(host_id) {
            Ok(names) => names.iter().for_each(|n| log::info!("  input:  {}", n)),
            Err(e) => log::warn!("  cannot list input devices: {}", e),
        }
        match get_output_devices(host_id) {
            Ok(names) => names.iter().for_each(|n| log::info!("  output: {}", n)),
            Err(e) => log::warn!("  cannot list output devices: {}", e),
        }
    }
}
