#[rocket::launch]
fn launch() -> _ {
    messaging_mux::rocket()
}
