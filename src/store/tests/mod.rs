mod channel;
mod invoice;
