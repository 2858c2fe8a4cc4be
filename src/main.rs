use std::env;
use urg::{MeasurementType, UrgBuilder};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().skip(1).collect();
    let ethernet = args.iter().any(|a| a == "-e");
    let device = args
        .iter()
        .find(|a| !a.starts_with('-'))
        .cloned()
        .unwrap_or_else(|| "/dev/ttyACM0".to_string());

    let mut urg = if ethernet {
        UrgBuilder::new().with_ethernet(&device)?.build()?
    } else {
        UrgBuilder::new().with_serial(&device).build()?
    };
    println!("serial number: {}", urg.sensor_id()?);
    println!("firmware: {}", urg.sensor_version()?);
    println!("status: {}", urg.sensor_status()?);

    let mut data = vec![0u32; urg.max_data_size()];
    let mut time_stamp = 0u32;
    urg.start_measurement(MeasurementType::Distance, 1, 0)?;
    let n = urg.get_distance(&mut data, Some(&mut time_stamp))?;
    println!("{} steps at {} [msec]", n, time_stamp);
    println!("front: {} [mm]", data[urg.step_to_index(0)]);

    Ok(())
}
