mod frame;
mod header;
mod packet;
mod primitive;
