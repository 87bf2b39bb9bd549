mod allocation;
mod shifting;
mod wire;
