//! Stack description commands

use nvstack_core::StackConfig;

use crate::stack::Stack;

/// Print the device settings and the partition table
pub fn cmd_info(config: &StackConfig, stack: &Stack) {
    let device = &config.device;
    println!("Device");
    println!("======");
    println!(
        "Flash size:     {} bytes ({} KiB)",
        device.size,
        device.size / 1024
    );
    println!("Sector size:    {} bytes", device.sector_size);
    println!("Code bank end:  0x{:08X}", device.code_bank_end);
    println!("Swap indicator: 0x{:08X}", device.swap_indicator);
    println!("Last command:   {:?}", stack.flash().command_state());
    match stack.image() {
        Some(path) => println!("Image:          {}", path.display()),
        None => println!("Image:          (none, changes are discarded)"),
    }
    if let Some(enc) = &config.encryption {
        println!(
            "Encryption:     key in '{}' at 0x{:X}, {}-byte windows",
            enc.key_partition, enc.key_offset, enc.window
        );
    }
    println!();

    println!(
        "{:<16} {:>10} {:>10} {:>10}  {:<8} {:<24} Flags",
        "Partition", "Start", "Size", "Data", "Medium", "Drivers"
    );
    println!("{}", "-".repeat(96));
    for part in stack.table().partitions() {
        let drivers: Vec<&str> = part.drivers.iter().map(|d| d.name()).collect();
        println!(
            "{:<16} 0x{:08X} {:>10} {:>10}  {:<8} {:<24} {}",
            part.name,
            part.phys_start,
            part.size,
            part.data_size,
            part.medium.to_string(),
            drivers.join(" > "),
            part.flags.names().join(",")
        );
        if !part.description.is_empty() {
            println!("{:<16} {}", "", part.description);
        }
    }
}

/// Validate the stack file and partition table
pub fn cmd_validate(config: &StackConfig) -> Result<(), Box<dyn std::error::Error>> {
    let stack = Stack::build(config)?;
    stack.table().validate()?;
    println!(
        "Stack OK: {} partitions on a {} KiB device",
        stack.table().partitions().len(),
        config.device.size / 1024
    );
    Ok(())
}
